//! Migration Manager - File system operations for migrations
//!
//! Loads `<id>.sql` files (plus optional `<id>.rollback.sql` siblings) from a
//! migrations directory and creates new timestamped migration files.

use chrono::Utc;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Location, Token, Tokenizer};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use shale_core::MigrateConfig;

use super::definitions::MigrationRecord;
use super::graph::DependencyGraph;
use crate::error::{MigrateError, MigrateResult};

const SQL_EXTENSION: &str = ".sql";
const ROLLBACK_EXTENSION: &str = ".rollback.sql";

/// Migration manager for creating and loading migrations
#[derive(Debug, Clone)]
pub struct MigrationManager {
    migrations_dir: PathBuf,
}

impl MigrationManager {
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
        }
    }

    pub fn from_config(config: &MigrateConfig) -> Self {
        Self::new(config.migrations_dir.clone())
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    /// Load every migration in the directory, in ascending id order
    pub fn load_migrations(&self) -> MigrateResult<Vec<MigrationRecord>> {
        if !self.migrations_dir.is_dir() {
            return Err(MigrateError::source_error(
                &self.migrations_dir,
                "migrations directory does not exist",
            ));
        }

        let mut forward_files = BTreeMap::new();
        let mut rollback_files = BTreeMap::new();

        let entries = fs::read_dir(&self.migrations_dir)
            .map_err(|e| MigrateError::source_error(&self.migrations_dir, format!("failed to read directory: {}", e)))?;

        for entry in entries {
            let path = entry
                .map_err(|e| MigrateError::source_error(&self.migrations_dir, format!("failed to read directory entry: {}", e)))?
                .path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name() else {
                continue;
            };
            let Some(file_name) = file_name.to_str() else {
                if file_name.to_string_lossy().ends_with(SQL_EXTENSION) {
                    return Err(MigrateError::source_error(&path, "migration file name is not valid UTF-8"));
                }
                continue;
            };

            if let Some(id) = file_name.strip_suffix(ROLLBACK_EXTENSION) {
                rollback_files.insert(id.to_string(), path.clone());
            } else if let Some(id) = file_name.strip_suffix(SQL_EXTENSION) {
                forward_files.insert(id.to_string(), path.clone());
            }
        }

        if let Some((id, path)) = rollback_files
            .iter()
            .find(|(id, _)| !forward_files.contains_key(*id))
        {
            return Err(MigrateError::source_error(
                path,
                format!("rollback file has no matching migration '{}{}'", id, SQL_EXTENSION),
            ));
        }

        let mut migrations = Vec::with_capacity(forward_files.len());
        for (id, path) in &forward_files {
            if id.is_empty() {
                return Err(MigrateError::source_error(path, "migration file name has an empty id"));
            }
            migrations.push(self.parse_migration_file(id, path, rollback_files.get(id))?);
        }

        tracing::debug!(
            "Loaded {} migration(s) from {}",
            migrations.len(),
            self.migrations_dir.display()
        );
        Ok(migrations)
    }

    /// Load the directory and validate it into a dependency graph
    pub fn load_graph(&self) -> MigrateResult<DependencyGraph> {
        DependencyGraph::build(self.load_migrations()?)
    }

    fn parse_migration_file(
        &self,
        id: &str,
        path: &Path,
        rollback_path: Option<&PathBuf>,
    ) -> MigrateResult<MigrationRecord> {
        let content = fs::read_to_string(path)
            .map_err(|e| MigrateError::source_error(path, format!("failed to read migration file: {}", e)))?;
        let parsed = parse_migration_content(&content).map_err(|message| MigrateError::source_error(path, message))?;

        let mut backward_sql = parsed.down_sql;
        if let Some(rollback_path) = rollback_path {
            if parsed.has_down_section {
                return Err(MigrateError::source_error(
                    path,
                    "migration has both a down section and a rollback file",
                ));
            }
            let rollback = fs::read_to_string(rollback_path)
                .map_err(|e| MigrateError::source_error(rollback_path, format!("failed to read rollback file: {}", e)))?;
            backward_sql = rollback;
        }

        let mut record = MigrationRecord::new(id).with_source(path);
        if let Some(description) = parsed.description {
            record = record.describe(description);
        }
        for dependency in parsed.depends_on {
            record = record.depends_on(dependency);
        }
        for statement in split_sql_statements(&parsed.up_sql) {
            record = record.forward(statement);
        }
        for statement in split_sql_statements(&backward_sql) {
            record = record.backward(statement);
        }

        Ok(record)
    }

    /// Create a new migration file and return its path
    ///
    /// With `depends_on_latest` the new migration depends on the migration
    /// with the greatest existing id.
    pub fn create_migration(&self, name: &str, depends_on_latest: bool) -> MigrateResult<PathBuf> {
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(MigrateError::source_error(
                &self.migrations_dir,
                format!("'{}' is not a usable migration name", name),
            ));
        }

        fs::create_dir_all(&self.migrations_dir)
            .map_err(|e| MigrateError::source_error(&self.migrations_dir, format!("failed to create migrations directory: {}", e)))?;

        let latest = if depends_on_latest {
            self.load_migrations()?
                .into_iter()
                .map(|migration| migration.id().to_string())
                .max()
        } else {
            None
        };

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let migration_id = format!("{}_{}", timestamp, slug);
        let filepath = self.migrations_dir.join(format!("{}{}", migration_id, SQL_EXTENSION));
        if filepath.exists() {
            return Err(MigrateError::source_error(&filepath, "migration file already exists"));
        }

        fs::write(&filepath, migration_template(name, latest.as_deref()))
            .map_err(|e| MigrateError::source_error(&filepath, format!("failed to write migration file: {}", e)))?;

        tracing::info!("Created migration {}", filepath.display());
        Ok(filepath)
    }
}

#[derive(Debug, Default)]
struct ParsedMigration {
    description: Option<String>,
    depends_on: Vec<String>,
    up_sql: String,
    down_sql: String,
    has_down_section: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Header,
    Up,
    Down,
}

/// Split file content into header fields and up/down bodies
fn parse_migration_content(content: &str) -> Result<ParsedMigration, String> {
    let mut parsed = ParsedMigration::default();
    let mut up_lines = Vec::new();
    let mut down_lines = Vec::new();
    let mut section = Section::Header;
    let mut saw_marker = false;

    for line in content.lines() {
        let trimmed = line.trim();
        let comment = trimmed.strip_prefix("--").map(str::trim);

        if let Some(marker) = comment.and_then(section_marker) {
            section = marker;
            saw_marker = true;
            if marker == Section::Down {
                parsed.has_down_section = true;
            }
            continue;
        }

        if let Some(comment) = comment {
            if let Some(list) = strip_prefix_ignore_case(comment, "depends:") {
                if section != Section::Header {
                    return Err("depends header must precede the migration SQL and section markers".to_string());
                }
                parsed.depends_on.extend(
                    list.split(|c: char| c == ',' || c.is_whitespace())
                        .filter(|dep| !dep.is_empty())
                        .map(str::to_string),
                );
                continue;
            }
            if section == Section::Header {
                if parsed.description.is_none() && !comment.is_empty() {
                    parsed.description = Some(comment.to_string());
                }
                continue;
            }
        }

        match section {
            Section::Header if trimmed.is_empty() => {}
            Section::Header | Section::Up => {
                section = Section::Up;
                up_lines.push(line);
            }
            Section::Down => down_lines.push(line),
        }
    }

    if saw_marker && content_before_first_marker(content) {
        return Err("SQL found before the first section marker".to_string());
    }

    parsed.up_sql = up_lines.join("\n");
    parsed.down_sql = down_lines.join("\n");
    Ok(parsed)
}

fn section_marker(comment: &str) -> Option<Section> {
    match comment.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ").as_str() {
        "up" | "up migration" => Some(Section::Up),
        "down" | "down migration" => Some(Section::Down),
        _ => None,
    }
}

/// True when a non-comment line appears before any section marker
fn content_before_first_marker(content: &str) -> bool {
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(comment) = trimmed.strip_prefix("--") {
            if section_marker(comment.trim()).is_some() {
                return false;
            }
        } else if !trimmed.is_empty() {
            return true;
        }
    }
    false
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &value[prefix.len()..])
}

/// Lowercase alphanumerics joined by single underscores
fn slugify(name: &str) -> String {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

fn migration_template(name: &str, depends_on: Option<&str>) -> String {
    let mut template = format!("-- {}\n", name);
    if let Some(dependency) = depends_on {
        template.push_str(&format!("-- depends: {}\n", dependency));
    }
    template.push_str(
        "\n-- Up migration\n\
         -- Add your schema changes here\n\n\n\
         -- Down migration\n\
         -- Add rollback statements here\n\n",
    );
    template
}

/// Split SQL into individual statements at top-level semicolons
///
/// Statements are sliced from the input verbatim. Semicolons inside string
/// literals, quoted identifiers, dollar-quoted bodies and comments do not
/// split. Segments holding only comments are dropped. SQL the tokenizer
/// rejects is passed through as a single statement.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    if sql.trim().is_empty() {
        return Vec::new();
    }

    let tokens = match Tokenizer::new(&PostgreSqlDialect {}, sql).tokenize_with_location() {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::warn!("SQL tokenizing failed, running the section as one statement: {}", e);
            return vec![sql.trim().to_string()];
        }
    };

    let line_starts = line_starts(sql);
    let mut statements = Vec::new();
    let mut statement_start = None;

    for token in &tokens {
        match &token.token {
            Token::SemiColon => {
                if let Some(start) = statement_start.take() {
                    let end = byte_offset(sql, &line_starts, &token.location);
                    push_statement(&mut statements, &sql[start..end]);
                }
            }
            Token::Whitespace(_) | Token::EOF => {}
            _ => {
                if statement_start.is_none() {
                    statement_start = Some(byte_offset(sql, &line_starts, &token.location));
                }
            }
        }
    }
    if let Some(start) = statement_start {
        push_statement(&mut statements, &sql[start..]);
    }

    statements
}

fn push_statement(statements: &mut Vec<String>, text: &str) {
    let text = text.trim_end();
    if !text.is_empty() {
        statements.push(text.to_string());
    }
}

/// Byte offset of the first character of every line
fn line_starts(sql: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(sql.match_indices('\n').map(|(index, _)| index + 1))
        .collect()
}

/// Tokenizer locations are 1-based lines and character columns
fn byte_offset(sql: &str, line_starts: &[usize], location: &Location) -> usize {
    let Some(&line_start) = line_starts.get((location.line.max(1) - 1) as usize) else {
        return sql.len();
    };
    sql[line_start..]
        .char_indices()
        .nth((location.column.max(1) - 1) as usize)
        .map_or(sql.len(), |(index, _)| line_start + index)
}
