//! Last gate before execution: the emitted text must parse back into a
//! single plain SELECT over one table.

use super::CompiledStatement;
use log::debug;
use sqlparser::ast::{SetExpr, Statement, TableFactor};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UnsafeStatement {
    #[error("SQL parsing error: {0}")]
    SqlParseError(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Statement has {placeholders} placeholders but {params} parameters")]
    ParameterMismatch { placeholders: usize, params: usize },
}

pub fn ensure_read_only(statement: &CompiledStatement) -> Result<(), UnsafeStatement> {
    let placeholders = statement.placeholder_count();
    if placeholders != statement.params.len() {
        return Err(UnsafeStatement::ParameterMismatch {
            placeholders,
            params: statement.params.len(),
        });
    }

    let ast = Parser::parse_sql(&GenericDialect {}, &statement.sql)
        .map_err(|e| UnsafeStatement::SqlParseError(e.to_string()))?;

    let query = match ast.as_slice() {
        [Statement::Query(query)] => query,
        [_] => {
            return Err(UnsafeStatement::PermissionDenied(
                "Only read-only SQL statements are allowed".to_string(),
            ))
        }
        statements => {
            return Err(UnsafeStatement::PermissionDenied(format!(
                "Expected exactly one statement, found {}",
                statements.len()
            )))
        }
    };

    if query.with.is_some() {
        return Err(UnsafeStatement::PermissionDenied(
            "Common table expressions are not allowed".to_string(),
        ));
    }
    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select,
        _ => {
            return Err(UnsafeStatement::PermissionDenied(
                "Only a plain SELECT is allowed".to_string(),
            ))
        }
    };
    match select.from.as_slice() {
        [source]
            if source.joins.is_empty() && matches!(source.relation, TableFactor::Table { .. }) => {}
        _ => {
            return Err(UnsafeStatement::PermissionDenied(
                "Statement must read exactly one table without joins".to_string(),
            ))
        }
    }

    debug!("Statement passed read-only check: {}", statement.sql);
    Ok(())
}
