//! Pure construction of the mysqldump argument list.
//!
//! No I/O happens here; the selection rules are a straight mapping from
//! connection, filter state and database list, which keeps them unit
//! testable without mocks.

use crate::config::ConnectionConfig;

/// Flag emitted when every database on the server is selected.
pub const ALL_DATABASES_FLAG: &str = "--all-databases";

/// Flag prefixing an explicit multi-database selection.
pub const DATABASES_FLAG: &str = "--databases";

/// Build the full argument vector for one dump invocation.
///
/// Selection rules, in priority order:
/// 1. An explicit single database is emitted as a bare name, never behind
///    `--databases`; a bare-name dump restores cleanly under a different
///    database name.
/// 2. With no filter active and the list covering every database on the
///    server, `--all-databases` is emitted instead of names.
/// 3. A filtered list of exactly one entry is emitted as a bare name for
///    the same restorability reason as rule 1.
/// 4. Otherwise `--databases` followed by all names.
pub fn build_dump_args(
    connection: &ConnectionConfig,
    filter_active: bool,
    databases: &[String],
    single_database: Option<&str>,
    total_on_server: usize,
    schema_only: bool,
    extra_args: &[String],
) -> Vec<String> {
    let mut args = vec![
        format!("--host={}", connection.host),
        format!("--port={}", connection.port),
        format!("--user={}", connection.user),
        format!("--password={}", connection.password),
    ];
    args.extend(extra_args.iter().cloned());

    if schema_only {
        args.push("--no-data".to_string());
    }

    if let Some(name) = single_database {
        args.push(name.to_string());
    } else if !filter_active && !databases.is_empty() && databases.len() == total_on_server {
        args.push(ALL_DATABASES_FLAG.to_string());
    } else if databases.len() == 1 {
        args.push(databases[0].clone());
    } else {
        args.push(DATABASES_FLAG.to_string());
        args.extend(databases.iter().cloned());
    }

    args
}
