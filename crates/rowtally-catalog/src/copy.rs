//! Backup and copy planning
//!
//! Copies keep the schema and the daily partitions of their source: the
//! destination is created first, then loaded with one INSERT-SELECT per
//! partition of a day partitioned table, or a single one for any other
//! table. Tables are processed one at a time and each destination sees at
//! most one create-then-load sequence.
//!
//! Naming follows `<table><separator><suffix>` with the reserved suffixes
//! `copy` and `backup`.

use std::sync::Arc;

use rowtally_core::{Partitioning, TableDescriptor};
use rowtally_sql::{statements, Dialect};

use crate::adapter::{FetchError, WarehouseClient};
use crate::filter::read_partitions;

pub const COPY_SUFFIX: &str = "copy";
pub const BACKUP_SUFFIX: &str = "backup";

/// Naming rules for copies and backups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupNaming {
    pub separator: String,
    pub reserved: Vec<String>,
}

impl Default for BackupNaming {
    fn default() -> Self {
        Self {
            separator: "_".to_string(),
            reserved: vec![COPY_SUFFIX.to_string(), BACKUP_SUFFIX.to_string()],
        }
    }
}

impl BackupNaming {
    pub fn rename(&self, table: &str, suffix: &str) -> String {
        format!("{}{}{}", table, self.separator, suffix)
    }

    /// Strip `suffix` when it is the last part of the name
    pub fn reverse(&self, table: &str, suffix: &str) -> String {
        match table.rsplit_once(self.separator.as_str()) {
            Some((base, last)) if last == suffix => base.to_string(),
            _ => table.to_string(),
        }
    }

    pub fn has_suffix(&self, table: &str, suffix: &str) -> bool {
        table.rsplit(self.separator.as_str()).next() == Some(suffix)
    }

    pub fn is_any_copy(&self, table: &str) -> bool {
        self.reserved.iter().any(|s| self.has_suffix(table, s))
    }

    /// Table names plus every reserved-suffix variant of them
    pub fn expand(&self, tables: &[String]) -> Vec<String> {
        let mut out = tables.to_vec();
        for table in tables {
            for suffix in &self.reserved {
                out.push(self.rename(table, suffix));
            }
        }
        out
    }
}

/// Operation applied to every selected table of a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOperation {
    /// `t` to `t_backup`, all columns
    Backup,
    /// `t_backup` back to `t`
    Restore,
    /// `t` to `t_copy` without the excluded columns
    Copy,
    /// `t_copy` back to `t` without the excluded columns
    Reverse,
    /// Drop every copy and backup
    Clean,
    /// Drop every table that is not a copy or a backup
    DropOriginals,
}

impl CopyOperation {
    pub fn name(&self) -> &'static str {
        match self {
            CopyOperation::Backup => "backup",
            CopyOperation::Restore => "restore",
            CopyOperation::Copy => "copy",
            CopyOperation::Reverse => "reverse",
            CopyOperation::Clean => "clean",
            CopyOperation::DropOriginals => "drop",
        }
    }
}

/// Statements for one destination table, run in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePlan {
    pub source: String,
    pub dest: Option<String>,
    pub statements: Vec<String>,
}

/// Plans and runs copy operations against one warehouse
pub struct CopyPlanner {
    client: Arc<dyn WarehouseClient>,
    naming: BackupNaming,

    /// Columns left out of `Copy` and `Reverse`
    exclude_columns: Vec<String>,
}

impl CopyPlanner {
    pub fn new(client: Arc<dyn WarehouseClient>) -> Self {
        Self {
            client,
            naming: BackupNaming::default(),
            exclude_columns: Vec::new(),
        }
    }

    pub fn with_naming(mut self, naming: BackupNaming) -> Self {
        self.naming = naming;
        self
    }

    pub fn with_excluded_columns(mut self, columns: Vec<String>) -> Self {
        self.exclude_columns = columns;
        self
    }

    pub fn naming(&self) -> &BackupNaming {
        &self.naming
    }

    /// Tables an operation applies to, after the ignore and only lists
    ///
    /// Both lists also cover the copies and backups of the named tables.
    pub fn select<'a>(
        &self,
        operation: CopyOperation,
        tables: &'a [TableDescriptor],
        ignore: &[String],
        only: &[String],
    ) -> Vec<&'a TableDescriptor> {
        let ignore = self.naming.expand(ignore);
        let only = self.naming.expand(only);

        tables
            .iter()
            .filter(|t| if only.is_empty() { !ignore.contains(&t.name) } else { only.contains(&t.name) })
            .filter(|t| match operation {
                CopyOperation::Backup | CopyOperation::Copy | CopyOperation::DropOriginals => {
                    !self.naming.is_any_copy(&t.name)
                }
                CopyOperation::Restore => self.naming.has_suffix(&t.name, BACKUP_SUFFIX),
                CopyOperation::Reverse => self.naming.has_suffix(&t.name, COPY_SUFFIX),
                CopyOperation::Clean => self.naming.is_any_copy(&t.name),
            })
            .collect()
    }

    /// Build the statements for one source table
    pub async fn plan(&self, operation: CopyOperation, source: &TableDescriptor) -> Result<TablePlan, FetchError> {
        let dialect = self.client.dialect();
        let source_ref = self.client.table_ref(&source.name)?;

        let (dest, exclude): (String, &[String]) = match operation {
            CopyOperation::Clean | CopyOperation::DropOriginals => {
                return Ok(TablePlan {
                    source: source.name.clone(),
                    dest: None,
                    statements: vec![statements::drop_table(dialect, &source_ref)],
                });
            }
            CopyOperation::Backup => (self.naming.rename(&source.name, BACKUP_SUFFIX), &[][..]),
            CopyOperation::Restore => (self.naming.reverse(&source.name, BACKUP_SUFFIX), &[][..]),
            CopyOperation::Copy => (self.naming.rename(&source.name, COPY_SUFFIX), self.exclude_columns.as_slice()),
            CopyOperation::Reverse => (self.naming.reverse(&source.name, COPY_SUFFIX), self.exclude_columns.as_slice()),
        };

        let dest_ref = source_ref.sibling(dest.clone())?;
        let columns: Vec<String> = source
            .columns
            .iter()
            .map(|c| c.name.clone())
            .filter(|c| !exclude.contains(c))
            .collect();

        let mut plan = vec![statements::create_like(dialect, &dest_ref, source, exclude)?];

        if dialect == Dialect::BigQuery && source.partitioning == Partitioning::Day {
            for partition in read_partitions(self.client.as_ref(), &source.name).await? {
                plan.push(statements::insert_select(
                    dialect,
                    &dest_ref,
                    &source_ref,
                    &columns,
                    Some(&partition),
                )?);
            }
        } else {
            plan.push(statements::insert_select(dialect, &dest_ref, &source_ref, &columns, None)?);
        }

        Ok(TablePlan {
            source: source.name.clone(),
            dest: Some(dest),
            statements: plan,
        })
    }

    /// Plan and run an operation table by table
    ///
    /// The first failing statement stops the run. Statements already run
    /// are not rolled back.
    pub async fn execute(
        &self,
        operation: CopyOperation,
        tables: &[&TableDescriptor],
    ) -> Result<Vec<TablePlan>, FetchError> {
        let mut done = Vec::with_capacity(tables.len());

        for table in tables {
            let plan = self.plan(operation, table).await?;
            tracing::info!(
                operation = operation.name(),
                source = %plan.source,
                dest = plan.dest.as_deref().unwrap_or("-"),
                statements = plan.statements.len(),
                "start"
            );
            for sql in &plan.statements {
                tracing::debug!(%sql, "run");
                self.client.execute(sql).await?;
            }
            tracing::info!(operation = operation.name(), source = %plan.source, "done");
            done.push(plan);
        }

        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn naming_round_trip() {
        let naming = BackupNaming::default();
        assert_eq!(naming.rename("daily_events", "backup"), "daily_events_backup");
        assert_eq!(naming.reverse("daily_events_backup", "backup"), "daily_events");
        assert_eq!(naming.reverse("daily_events_copy", "backup"), "daily_events_copy");
        assert!(naming.has_suffix("daily_events_copy", "copy"));
        assert!(!naming.has_suffix("daily_copy_events", "copy"));
        assert!(naming.is_any_copy("x_backup"));
        assert!(!naming.is_any_copy("x_backups"));
    }

    #[test]
    fn ignore_list_covers_copies() {
        let naming = BackupNaming::default();
        assert_eq!(
            naming.expand(&["t".to_string()]),
            vec!["t".to_string(), "t_copy".to_string(), "t_backup".to_string()]
        );
    }
}
