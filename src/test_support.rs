use crate::catalog::{Field, FieldOptions, Table};

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

pub fn table(ordering: &[&str], filtering: &[&str], search: &[&str]) -> Table {
    Table {
        id: 7,
        dataset_id: 3,
        dataset_slug: "socios-brasil".to_string(),
        version_id: 1,
        name: "empresas".to_string(),
        default: true,
        hidden: false,
        api_enabled: true,
        ordering: strings(ordering),
        filtering: strings(filtering),
        search: strings(search),
        import_date: None,
    }
}

pub fn field(name: &str, type_name: &str) -> Field {
    Field {
        id: 1,
        dataset_id: 3,
        table_id: 7,
        name: name.to_string(),
        title: name.to_string(),
        type_name: type_name.to_string(),
        null: true,
        order: 0,
        options: FieldOptions::default(),
        frontend_filter: false,
        has_choices: false,
        choices: None,
        obfuscate: false,
        show: true,
        link_template: None,
    }
}
