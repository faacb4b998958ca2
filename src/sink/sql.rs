//! SQL text shared by the relational sinks, generated from the column schema.

use crate::error::PipelineError;
use crate::record::{ColumnKind, COLUMNS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Mysql,
}

impl Dialect {
    fn quote(self, ident: &str) -> String {
        match self {
            Dialect::Sqlite => format!("\"{}\"", ident),
            Dialect::Mysql => format!("`{}`", ident),
        }
    }

    fn column_type(self, kind: ColumnKind) -> String {
        match (self, kind) {
            (_, ColumnKind::Text(len)) => format!("varchar({})", len),
            (Dialect::Sqlite, ColumnKind::Integer) => "INTEGER".to_string(),
            (Dialect::Mysql, ColumnKind::Integer) => "INT".to_string(),
            (_, ColumnKind::DateTime) => "DATETIME".to_string(),
        }
    }
}

/// Table and database names come from configuration and end up inside SQL text.
pub fn validate_identifier(name: &str) -> Result<(), PipelineError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PipelineError::Config(format!(
            "invalid SQL identifier {:?}",
            name
        )))
    }
}

pub fn create_table(dialect: Dialect, table: &str) -> String {
    let mut defs: Vec<String> = COLUMNS
        .iter()
        .map(|c| {
            let mut def = format!("{} {}", dialect.quote(c.name), dialect.column_type(c.kind));
            if c.name == "id" || c.name == "bid" {
                def.push_str(" NOT NULL");
            }
            if c.name == "id" && dialect == Dialect::Sqlite {
                def.push_str(" PRIMARY KEY");
            }
            def
        })
        .collect();

    match dialect {
        Dialect::Sqlite => format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            dialect.quote(table),
            defs.join(", ")
        ),
        Dialect::Mysql => {
            defs.push(format!("PRIMARY KEY ({})", dialect.quote("id")));
            format!(
                "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
                dialect.quote(table),
                defs.join(", ")
            )
        }
    }
}

/// Insert of every column that overwrites all non-key columns on an id conflict.
pub fn upsert(dialect: Dialect, table: &str) -> String {
    let columns: Vec<String> = COLUMNS.iter().map(|c| dialect.quote(c.name)).collect();
    let placeholders = vec!["?"; COLUMNS.len()].join(", ");
    let updates: Vec<String> = COLUMNS
        .iter()
        .filter(|c| c.name != "id")
        .map(|c| {
            let col = dialect.quote(c.name);
            match dialect {
                Dialect::Sqlite => format!("{} = excluded.{}", col, col),
                Dialect::Mysql => format!("{} = VALUES({})", col, col),
            }
        })
        .collect();

    let conflict = match dialect {
        Dialect::Sqlite => format!("ON CONFLICT({}) DO UPDATE SET", dialect.quote("id")),
        Dialect::Mysql => "ON DUPLICATE KEY UPDATE".to_string(),
    };
    format!(
        "INSERT INTO {} ({}) VALUES ({}) {} {}",
        dialect.quote(table),
        columns.join(", "),
        placeholders,
        conflict,
        updates.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::COLUMN_COUNT;

    #[test]
    fn sqlite_statements() {
        let ddl = create_table(Dialect::Sqlite, "weibo");
        assert!(ddl.starts_with(
            "CREATE TABLE IF NOT EXISTS \"weibo\" (\"id\" varchar(20) NOT NULL PRIMARY KEY, \"bid\" varchar(12) NOT NULL,"
        ));
        assert!(ddl.contains("\"reposts_count\" INTEGER"));
        assert!(ddl.contains("\"created_at\" DATETIME"));

        let sql = upsert(Dialect::Sqlite, "weibo");
        assert!(sql.contains("ON CONFLICT(\"id\") DO UPDATE SET \"bid\" = excluded.\"bid\""));
        assert!(!sql.contains("\"id\" = excluded"));
        assert_eq!(sql.matches('?').count(), COLUMN_COUNT);
    }

    #[test]
    fn mysql_statements() {
        let ddl = create_table(Dialect::Mysql, "weibo");
        assert!(ddl.contains("`vip_level` INT"));
        assert!(ddl.ends_with("PRIMARY KEY (`id`)) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"));

        let sql = upsert(Dialect::Mysql, "weibo");
        assert!(sql.contains("ON DUPLICATE KEY UPDATE `bid` = VALUES(`bid`)"));
        assert!(sql.ends_with("`vip_level` = VALUES(`vip_level`)"));
    }

    #[test]
    fn identifiers_are_checked() {
        assert!(validate_identifier("weibo_2025").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("weibo; DROP TABLE x").is_err());
        assert!(validate_identifier("微博").is_err());
    }
}
