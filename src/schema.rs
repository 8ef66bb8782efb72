diesel::table! {
    datasets (id) {
        id -> Int4,
        slug -> Varchar,
        name -> Text,
        description -> Text,
        show -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    versions (id) {
        id -> Int4,
        dataset_id -> Int4,
        name -> Text,
        order_num -> Int4,
        collected_at -> Nullable<Date>,
    }
}

diesel::table! {
    tables (id) {
        id -> Int4,
        dataset_id -> Int4,
        version_id -> Int4,
        name -> Varchar,
        is_default -> Bool,
        hidden -> Bool,
        api_enabled -> Bool,
        ordering -> Array<Text>,
        filtering -> Array<Text>,
        search -> Array<Text>,
        import_date -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    fields (id) {
        id -> Int4,
        dataset_id -> Int4,
        table_id -> Int4,
        name -> Varchar,
        title -> Varchar,
        field_type -> Varchar,
        nullable -> Bool,
        order_num -> Int4,
        options -> Jsonb,
        frontend_filter -> Bool,
        has_choices -> Bool,
        choices -> Nullable<Jsonb>,
        obfuscate -> Bool,
        show -> Bool,
        link_template -> Nullable<Text>,
    }
}

diesel::table! {
    data_tables (id) {
        id -> Int4,
        table_id -> Int4,
        db_table_name -> Varchar,
        active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(versions -> datasets (dataset_id));
diesel::joinable!(tables -> datasets (dataset_id));
diesel::joinable!(tables -> versions (version_id));
diesel::joinable!(fields -> tables (table_id));
diesel::joinable!(data_tables -> tables (table_id));

diesel::allow_tables_to_appear_in_same_query!(
    datasets,
    versions,
    tables,
    fields,
    data_tables,
);
