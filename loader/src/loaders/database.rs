//! Exports tables from a relational database into csv files

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use tokio::io::AsyncWriteExt;
use tracing::{Level, event, instrument};

use datasets::Error;

use super::{Loader, Options, run_command};
use crate::secrets::Secrets;

/// How many rows each select pulls
const BATCH_SIZE: i64 = 10000;

/// The parsed options for a database source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseLoaderOptions {
    /// The user to connect as
    pub username: String,
    /// The password to connect with
    pub password: String,
    /// The host to connect to
    pub host: String,
    /// The port to connect to
    pub port: String,
    /// The database to export from
    pub dbname: String,
    /// The tables to export
    pub tables: Vec<String>,
    /// The charset to connect with
    pub charset: String,
}

/// Exports tables from a relational database with the mysql cli
#[derive(Debug)]
pub struct DatabaseLoader {
    /// The shared loader options
    options: Options,
    /// The parsed database options
    db_options: DatabaseLoaderOptions,
}

impl DatabaseLoader {
    /// Build a new database loader
    ///
    /// # Arguments
    ///
    /// * `datasource_options` - The source specific option map
    /// * `options` - The shared loader options
    /// * `secrets` - The mounted credentials
    pub fn new(
        datasource_options: BTreeMap<String, String>,
        options: Options,
        secrets: Secrets,
    ) -> Result<Self, Error> {
        let mut db_options = convert_database_options(&datasource_options)?;
        // the mounted secret always wins, even an absent one, so inline
        // credentials in the option map never reach the client
        db_options.username = secrets
            .username
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_owned();
        db_options.password = secrets
            .password
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_owned();
        Ok(DatabaseLoader {
            options,
            db_options,
        })
    }

    /// Export one table into `<root>/<db>.<table>.csv`
    ///
    /// # Arguments
    ///
    /// * `table` - The table to export
    #[instrument(name = "DatabaseLoader::sync_table", skip(self), err(Debug))]
    async fn sync_table(&self, table: &str) -> Result<(), Error> {
        let opts = &self.db_options;
        let output_file = self
            .options
            .root
            .join(format!("{}.{}.csv", opts.dbname, table));
        // get the total row count first so progress is observable
        event!(Level::INFO, table, "fetching total row count");
        let total_rows = self.total_rows(table).await?;
        event!(Level::INFO, table, total_rows, "starting export");
        let mut file = tokio::fs::File::create(&output_file).await?;
        // export in batches, only the first batch carries headers
        let mut offset = 0;
        while offset < total_rows {
            let current = std::cmp::min(offset + BATCH_SIZE, total_rows);
            event!(Level::INFO, table, progress = current, total_rows);
            let query = format!("SELECT * FROM {table} LIMIT {BATCH_SIZE} OFFSET {offset};");
            let data = self.run_mysql(&query, offset > 0).await?;
            let csv = tsv_to_csv(&data);
            if !csv.is_empty() {
                file.write_all(csv.as_bytes()).await?;
                file.write_all(b"\n").await?;
            }
            offset += BATCH_SIZE;
        }
        file.flush().await?;
        event!(
            Level::INFO,
            table,
            output_file = %output_file.display(),
            "export completed"
        );
        Ok(())
    }

    /// Get the row count for a table
    ///
    /// # Arguments
    ///
    /// * `table` - The table to count
    async fn total_rows(&self, table: &str) -> Result<i64, Error> {
        let query = format!("SELECT COUNT(*) FROM {table};");
        let raw = self.run_mysql(&query, true).await?;
        raw.trim()
            .parse()
            .map_err(|error| Error::new(format!("failed to parse count: {error}")))
    }

    /// Run a query through the mysql cli and return its stdout
    ///
    /// The password goes through the environment so it never lands on argv.
    ///
    /// # Arguments
    ///
    /// * `query` - The query to run
    /// * `skip_header` - Whether to suppress the header row
    async fn run_mysql(&self, query: &str, skip_header: bool) -> Result<String, Error> {
        let opts = &self.db_options;
        let mut cmd = Command::new("mysql");
        cmd.arg(format!("-h{}", opts.host))
            .arg(format!("-P{}", opts.port))
            .arg(format!("-u{}", opts.username))
            .arg(format!("-D{}", opts.dbname))
            .arg("-e")
            .arg(query);
        if skip_header {
            // -N skips headers
            cmd.arg("-N");
        }
        cmd.env("MYSQL_PWD", &opts.password);
        let output = run_command(cmd).await?;
        Ok(String::from_utf8(output.stdout)?)
    }
}

#[async_trait]
impl Loader for DatabaseLoader {
    /// Export every configured table into our root
    ///
    /// # Arguments
    ///
    /// * `from_uri` - The uri to sync from
    /// * `to_path` - The path to sync into
    #[instrument(name = "DatabaseLoader::sync", skip(self), err(Debug))]
    async fn sync(&self, from_uri: &str, to_path: &Path) -> Result<(), Error> {
        let parsed = url::Url::parse(&self.options.uri)?;
        if parsed.scheme() != "database" {
            return Err(Error::new(format!(
                "invalid scheme {}, only database is supported",
                parsed.scheme()
            )));
        }
        for table in &self.db_options.tables {
            self.sync_table(table).await?;
        }
        Ok(())
    }
}

/// Parse the raw option map for a database source
///
/// # Arguments
///
/// * `options` - The raw option map to parse
fn convert_database_options(
    options: &BTreeMap<String, String>,
) -> Result<DatabaseLoaderOptions, Error> {
    let raw_tables = options
        .get("tables")
        .map(|tables| tables.trim())
        .unwrap_or_default();
    if raw_tables.is_empty() {
        return Err(Error::new("no table specified"));
    }
    let tables = raw_tables
        .split(',')
        .map(|table| table.trim().to_owned())
        .filter(|table| !table.is_empty())
        .collect::<Vec<String>>();
    if tables.is_empty() {
        return Err(Error::new("no table specified"));
    }
    let get = |key: &str| options.get(key).cloned().unwrap_or_default();
    Ok(DatabaseLoaderOptions {
        username: get("username"),
        password: get("password"),
        host: get("host"),
        port: get("port"),
        dbname: get("dbname"),
        tables,
        charset: get("charset"),
    })
}

/// Convert tab separated mysql output to comma separated csv
///
/// Fields containing separators or quotes are quoted with doubled quotes.
///
/// # Arguments
///
/// * `tsv` - The raw tab separated output
fn tsv_to_csv(tsv: &str) -> String {
    if tsv.is_empty() {
        return String::new();
    }
    let mut rows = Vec::new();
    for line in tsv.lines() {
        if line.is_empty() {
            continue;
        }
        let row = line
            .split('\t')
            .map(csv_escape)
            .collect::<Vec<String>>()
            .join(",");
        rows.push(row);
    }
    rows.join("\n")
}

/// Quote a single csv field if it needs it
///
/// # Arguments
///
/// * `field` - The field to quote
fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datasets::models::DatasetType;
    use std::path::PathBuf;

    /// Build shared options for testing
    fn options(uri: &str) -> Options {
        Options {
            root: PathBuf::from("/tmp/test"),
            uri: uri.to_owned(),
            kind: DatasetType::Database,
            bandwidth_limit: String::new(),
        }
    }

    /// Build a full raw option map for testing
    fn raw_options(tables: &str) -> BTreeMap<String, String> {
        let mut raw = BTreeMap::new();
        raw.insert("username".to_owned(), "testuser".to_owned());
        raw.insert("password".to_owned(), "testpass".to_owned());
        raw.insert("host".to_owned(), "localhost".to_owned());
        raw.insert("port".to_owned(), "3306".to_owned());
        raw.insert("dbname".to_owned(), "testdb".to_owned());
        raw.insert("charset".to_owned(), "utf8".to_owned());
        if !tables.is_empty() {
            raw.insert("tables".to_owned(), tables.to_owned());
        }
        raw
    }

    #[test]
    fn secrets_override_inline_credentials() {
        let secrets = Secrets {
            username: Some("secret_user\n".to_owned()),
            password: Some("secret_pass\n".to_owned()),
            ..Secrets::default()
        };
        let loader = DatabaseLoader::new(
            raw_options("table1,table2"),
            options("database://localhost:3306"),
            secrets,
        )
        .unwrap();
        assert_eq!(loader.db_options.username, "secret_user");
        assert_eq!(loader.db_options.password, "secret_pass");
        assert_eq!(loader.db_options.tables, ["table1", "table2"]);
    }

    #[test]
    fn inline_credentials_never_survive_absent_secrets() {
        let loader = DatabaseLoader::new(
            raw_options("table1"),
            options("database://localhost:3306"),
            Secrets::default(),
        )
        .unwrap();
        assert_eq!(loader.db_options.username, "");
        assert_eq!(loader.db_options.password, "");
    }

    #[test]
    fn convert_options_splits_tables() {
        let parsed = convert_database_options(&raw_options("users,orders,products")).unwrap();
        assert_eq!(parsed.tables, ["users", "orders", "products"]);
        assert_eq!(parsed.host, "localhost");
        assert_eq!(parsed.dbname, "testdb");
    }

    #[test]
    fn convert_options_accepts_single_table() {
        let parsed = convert_database_options(&raw_options("users")).unwrap();
        assert_eq!(parsed.tables, ["users"]);
    }

    #[test]
    fn convert_options_requires_tables() {
        let error = convert_database_options(&raw_options("")).unwrap_err();
        assert!(error.msg().contains("no table specified"));
    }

    #[tokio::test]
    async fn sync_rejects_wrong_scheme() {
        let loader = DatabaseLoader::new(
            raw_options("users"),
            options("mysql://localhost:3306"),
            Secrets::default(),
        )
        .unwrap();
        let error = loader
            .sync("mysql://localhost:3306", Path::new("/tmp/out"))
            .await
            .unwrap_err();
        assert!(
            error
                .msg()
                .contains("invalid scheme mysql, only database is supported")
        );
    }

    #[test]
    fn tsv_converts_to_csv() {
        let tsv = "id\tname\tnote\n1\talice\tplain\n2\tbob\thas,comma\n";
        let csv = tsv_to_csv(tsv);
        assert_eq!(csv, "id,name,note\n1,alice,plain\n2,bob,\"has,comma\"");
    }

    #[test]
    fn tsv_quotes_embedded_quotes() {
        let csv = tsv_to_csv("1\tsays \"hi\"\n");
        assert_eq!(csv, "1,\"says \"\"hi\"\"\"");
    }

    #[test]
    fn tsv_empty_input_yields_empty_output() {
        assert_eq!(tsv_to_csv(""), "");
    }
}
