//! Active-generation switching for logical tables.
//!
//! Every transition is planned from a snapshot of the table's generations and
//! applied inside one transaction that holds a row lock on the logical table,
//! so concurrent cutovers on the same table serialize and no committed state
//! ever has two active generations. Physical drops run after the commit.

use chrono::{DateTime, NaiveDate, Utc};
use diesel_async::{AsyncConnection, AsyncPgConnection};
use std::sync::Arc;
use tracing::{info, warn};

use crate::catalog::DataTable;
use crate::database::{self, DatabaseManager};
use crate::error::EngineError;
use crate::lifecycle::LifecycleManager;
use crate::registry::DynamicTableRegistry;

/// Metadata changes and physical drops resulting from one transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CutoverPlan {
    pub activate: Option<i32>,
    pub deactivate: Vec<i32>,
    /// Records deleted in the same transaction; their storage is in `drop`.
    pub remove: Vec<i32>,
    /// Physical tables to drop once the metadata change is committed.
    pub drop: Vec<String>,
}

impl CutoverPlan {
    pub fn is_noop(&self) -> bool {
        self.activate.is_none()
            && self.deactivate.is_empty()
            && self.remove.is_empty()
            && self.drop.is_empty()
    }
}

/// Catalog writes committed in the same transaction as an activation.
#[derive(Debug, Clone, Default)]
pub struct ActivationUpdates {
    /// `(field id, choices)` pairs.
    pub choices: Vec<(i32, Vec<String>)>,
    pub import_date: Option<DateTime<Utc>>,
    /// `(version id, collection date)`.
    pub collected_at: Option<(i32, NaiveDate)>,
}

fn find(generations: &[DataTable], data_table_id: i32) -> Result<&DataTable, EngineError> {
    generations
        .iter()
        .find(|g| g.id == data_table_id)
        .ok_or(EngineError::DataTableNotFound { id: data_table_id })
}

/// Makes `target_id` the only active generation among `generations`.
pub fn plan_activation(
    generations: &[DataTable],
    target_id: i32,
    drop_inactive: bool,
) -> Result<CutoverPlan, EngineError> {
    let target = find(generations, target_id)?;

    let previous: Vec<&DataTable> = generations
        .iter()
        .filter(|g| g.active && g.id != target.id)
        .collect();

    let mut plan = CutoverPlan {
        activate: if target.active { None } else { Some(target.id) },
        deactivate: previous.iter().map(|g| g.id).collect(),
        ..CutoverPlan::default()
    };
    if drop_inactive {
        plan.remove = plan.deactivate.clone();
        plan.drop = previous.iter().map(|g| g.db_table_name.clone()).collect();
    }
    Ok(plan)
}

/// Most recently created generation other than `exclude` that is inactive.
pub fn rollback_target(generations: &[DataTable], exclude: i32) -> Option<&DataTable> {
    generations
        .iter()
        .filter(|g| g.id != exclude && !g.active)
        .max_by_key(|g| (g.created_at, g.id))
}

/// Deactivates `target_id`. With `activate_most_recent`, an active target hands
/// over to the previous generation; the target is only dropped when no
/// rollback happened.
pub fn plan_deactivation(
    generations: &[DataTable],
    target_id: i32,
    drop_table: bool,
    activate_most_recent: bool,
) -> Result<CutoverPlan, EngineError> {
    let target = find(generations, target_id)?;

    let mut plan = CutoverPlan {
        deactivate: if target.active { vec![target.id] } else { Vec::new() },
        ..CutoverPlan::default()
    };

    if activate_most_recent && target.active {
        if let Some(previous) = rollback_target(generations, target.id) {
            plan.activate = Some(previous.id);
            return Ok(plan);
        }
    }

    if drop_table {
        plan.remove.push(target.id);
        plan.drop.push(target.db_table_name.clone());
    }
    Ok(plan)
}

/// Refuses to remove an active generation.
pub fn check_deletable(data_table: &DataTable) -> Result<(), EngineError> {
    if data_table.active {
        return Err(EngineError::ActiveDataTableDeletion {
            db_table_name: data_table.db_table_name.clone(),
        });
    }
    Ok(())
}

async fn apply_in(conn: &mut AsyncPgConnection, plan: &CutoverPlan) -> Result<(), EngineError> {
    database::set_active(conn, &plan.deactivate, false).await?;
    if let Some(id) = plan.activate {
        database::set_active(conn, &[id], true).await?;
    }
    for id in &plan.remove {
        database::delete_data_table_record(conn, *id).await?;
    }
    Ok(())
}

/// Plans and applies an activation on a connection already inside a
/// transaction.
pub async fn activate_in(
    conn: &mut AsyncPgConnection,
    data_table: &DataTable,
    drop_inactive: bool,
) -> Result<CutoverPlan, EngineError> {
    database::lock_table(conn, data_table.table_id).await?;
    let generations = database::generations(conn, data_table.table_id).await?;
    let plan = plan_activation(&generations, data_table.id, drop_inactive)?;
    apply_in(conn, &plan).await?;
    Ok(plan)
}

/// Removes the record of an inactive generation under the table lock and
/// returns it; its storage is dropped by the caller after commit.
pub async fn delete_in(
    conn: &mut AsyncPgConnection,
    data_table: &DataTable,
) -> Result<DataTable, EngineError> {
    database::lock_table(conn, data_table.table_id).await?;
    let current = database::get_data_table(conn, data_table.id).await?;
    check_deletable(&current)?;
    database::delete_data_table_record(conn, current.id).await?;
    Ok(current)
}

pub async fn deactivate_in(
    conn: &mut AsyncPgConnection,
    data_table: &DataTable,
    drop_table: bool,
    activate_most_recent: bool,
) -> Result<CutoverPlan, EngineError> {
    database::lock_table(conn, data_table.table_id).await?;
    let generations = database::generations(conn, data_table.table_id).await?;
    let plan = plan_deactivation(&generations, data_table.id, drop_table, activate_most_recent)?;
    apply_in(conn, &plan).await?;
    Ok(plan)
}

#[derive(Clone)]
pub struct CutoverController {
    database: DatabaseManager,
    lifecycle: LifecycleManager,
    registry: Arc<DynamicTableRegistry>,
}

impl CutoverController {
    pub fn new(
        database: DatabaseManager,
        lifecycle: LifecycleManager,
        registry: Arc<DynamicTableRegistry>,
    ) -> Self {
        Self {
            database,
            lifecycle,
            registry,
        }
    }

    pub async fn activate(
        &self,
        data_table: &DataTable,
        drop_inactive: bool,
    ) -> Result<CutoverPlan, EngineError> {
        self.activate_with(data_table, drop_inactive, &ActivationUpdates::default())
            .await
    }

    /// Applies `updates` and activates `data_table` in the same transaction.
    pub async fn activate_with(
        &self,
        data_table: &DataTable,
        drop_inactive: bool,
        updates: &ActivationUpdates,
    ) -> Result<CutoverPlan, EngineError> {
        info!("Activating DataTable {}", data_table.db_table_name);
        let mut conn = self.database.connection().await?;

        let plan = conn
            .transaction::<_, EngineError, _>(|conn| {
                Box::pin(async move {
                    let plan = activate_in(conn, data_table, drop_inactive).await?;
                    for (field_id, values) in &updates.choices {
                        database::save_choices(conn, *field_id, values).await?;
                    }
                    if let Some(import_date) = updates.import_date {
                        database::set_import_date(conn, data_table.table_id, import_date).await?;
                    }
                    if let Some((version_id, collected_at)) = updates.collected_at {
                        database::set_collected_at(conn, version_id, collected_at).await?;
                    }
                    Ok(plan)
                })
            })
            .await?;
        drop(conn);

        self.finish(data_table.table_id, &plan).await?;
        Ok(plan)
    }

    pub async fn deactivate(
        &self,
        data_table: &DataTable,
        drop_table: bool,
        activate_most_recent: bool,
    ) -> Result<CutoverPlan, EngineError> {
        info!("Deactivating DataTable {}", data_table.db_table_name);
        let mut conn = self.database.connection().await?;

        let plan = conn
            .transaction::<_, EngineError, _>(|conn| {
                Box::pin(async move {
                    deactivate_in(conn, data_table, drop_table, activate_most_recent).await
                })
            })
            .await?;
        drop(conn);

        if activate_most_recent && plan.activate.is_none() && !plan.deactivate.is_empty() {
            warn!(
                "No previous generation to roll back to, table {} is left without an active DataTable",
                data_table.table_id
            );
        }
        self.finish(data_table.table_id, &plan).await?;
        Ok(plan)
    }

    /// Deletes an inactive generation: its record, then its storage.
    pub async fn delete(&self, data_table: &DataTable) -> Result<(), EngineError> {
        let mut conn = self.database.connection().await?;
        let deleted = conn
            .transaction::<_, EngineError, _>(|conn| {
                Box::pin(async move { delete_in(conn, data_table).await })
            })
            .await?;
        drop(conn);

        self.registry.invalidate(deleted.table_id);
        self.lifecycle.drop_by_name(&deleted.db_table_name).await?;
        info!("Deleted DataTable {}", deleted.db_table_name);
        Ok(())
    }

    async fn finish(&self, table_id: i32, plan: &CutoverPlan) -> Result<(), EngineError> {
        self.registry.invalidate(table_id);
        for db_table_name in &plan.drop {
            self.lifecycle.drop_by_name(db_table_name).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn generation(id: i32, active: bool) -> DataTable {
        DataTable {
            id,
            table_id: 7,
            db_table_name: format!("data_x_y_{}", id),
            active,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(id as i64),
        }
    }

    fn apply(generations: &mut Vec<DataTable>, plan: &CutoverPlan) {
        generations.retain(|g| !plan.remove.contains(&g.id));
        for g in generations.iter_mut() {
            if plan.deactivate.contains(&g.id) {
                g.active = false;
            }
            if plan.activate == Some(g.id) {
                g.active = true;
            }
        }
    }

    fn active_ids(generations: &[DataTable]) -> Vec<i32> {
        generations.iter().filter(|g| g.active).map(|g| g.id).collect()
    }

    #[test]
    fn activation_cascades_deactivation() {
        let mut generations = vec![generation(1, true), generation(2, false)];
        let plan = plan_activation(&generations, 2, false).unwrap();
        assert_eq!(plan.activate, Some(2));
        assert_eq!(plan.deactivate, vec![1]);
        assert!(plan.drop.is_empty());

        apply(&mut generations, &plan);
        assert_eq!(active_ids(&generations), vec![2]);
    }

    #[test]
    fn activation_can_drop_previous_generation() {
        let generations = vec![generation(1, true), generation(2, false)];
        let plan = plan_activation(&generations, 2, true).unwrap();
        assert_eq!(plan.remove, vec![1]);
        assert_eq!(plan.drop, vec!["data_x_y_1".to_string()]);
    }

    #[test]
    fn dropped_generation_is_never_a_rollback_target() {
        let mut generations = vec![generation(1, true), generation(2, false)];
        let plan = plan_activation(&generations, 2, true).unwrap();
        apply(&mut generations, &plan);

        let plan = plan_deactivation(&generations, 2, false, true).unwrap();
        assert_eq!(plan.activate, None);
        assert_eq!(plan.deactivate, vec![2]);
        apply(&mut generations, &plan);
        assert!(active_ids(&generations).is_empty());
    }

    #[test]
    fn activating_the_active_generation_changes_nothing() {
        let generations = vec![generation(1, false), generation(2, true)];
        let plan = plan_activation(&generations, 2, true).unwrap();
        assert!(plan.is_noop());
    }

    #[test]
    fn at_most_one_active_across_sequences() {
        let mut generations: Vec<DataTable> = (1..=4).map(|id| generation(id, false)).collect();
        let steps: Vec<Box<dyn Fn(&[DataTable]) -> CutoverPlan>> = vec![
            Box::new(|g| plan_activation(g, 1, false).unwrap()),
            Box::new(|g| plan_activation(g, 3, false).unwrap()),
            Box::new(|g| plan_deactivation(g, 3, false, true).unwrap()),
            Box::new(|g| plan_activation(g, 4, false).unwrap()),
            Box::new(|g| plan_deactivation(g, 1, true, false).unwrap()),
            Box::new(|g| plan_deactivation(g, 4, false, false).unwrap()),
            Box::new(|g| plan_activation(g, 2, false).unwrap()),
        ];
        for step in steps {
            let plan = step(&generations);
            apply(&mut generations, &plan);
            assert!(active_ids(&generations).len() <= 1, "{:?}", generations);
        }
        assert_eq!(active_ids(&generations), vec![2]);
    }

    #[test]
    fn deactivate_rolls_back_to_most_recent_previous() {
        let mut generations = vec![generation(1, false), generation(2, false), generation(3, true)];
        let plan = plan_deactivation(&generations, 3, true, true).unwrap();
        assert_eq!(plan.activate, Some(2));
        assert_eq!(plan.deactivate, vec![3]);
        // No drop once a rollback happened.
        assert!(plan.drop.is_empty());

        apply(&mut generations, &plan);
        assert_eq!(active_ids(&generations), vec![2]);
    }

    #[test]
    fn deactivate_without_previous_leaves_no_active_generation() {
        let mut generations = vec![generation(1, true)];
        let plan = plan_deactivation(&generations, 1, true, true).unwrap();
        assert_eq!(plan.activate, None);
        assert_eq!(plan.remove, vec![1]);
        assert_eq!(plan.drop, vec!["data_x_y_1".to_string()]);

        apply(&mut generations, &plan);
        assert!(active_ids(&generations).is_empty());
    }

    #[test]
    fn rollback_is_ignored_for_inactive_target() {
        let generations = vec![generation(1, false), generation(2, true), generation(3, false)];
        let plan = plan_deactivation(&generations, 3, false, true).unwrap();
        assert!(plan.is_noop());
    }

    #[test]
    fn unknown_generation_is_rejected() {
        let generations = vec![generation(1, true)];
        assert!(matches!(
            plan_activation(&generations, 9, false),
            Err(EngineError::DataTableNotFound { id: 9 })
        ));
    }

    #[test]
    fn active_generation_cannot_be_deleted() {
        assert!(matches!(
            check_deletable(&generation(1, true)),
            Err(EngineError::ActiveDataTableDeletion { .. })
        ));
        assert!(check_deletable(&generation(1, false)).is_ok());
    }
}
