//! Disposable Postgres databases for integration tests.
//!
//! `AUTHPLANE_TEST_DATABASE_URL` points at an existing server; each call then
//! creates a uniquely named database on it. Without the variable a private
//! cluster is spawned from local `initdb`/`postgres` binaries. Callers skip
//! their test when [`start_postgres`] returns an error.

use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};
use postgres::NoTls;
use url::Url;

const DATABASE_URL_ENV: &str = "AUTHPLANE_TEST_DATABASE_URL";

/// Handle to a disposable database; everything is torn down on drop.
pub struct TestDatabase {
    connection_string: String,
    owner: Option<AdminHandle>,
    #[expect(dead_code, reason = "held only so the spawned server is torn down on drop")]
    server: Option<LocalServer>,
}

struct AdminHandle {
    admin_url: String,
    database: String,
}

struct LocalServer {
    process: Child,
    data_dir: PathBuf,
}

impl TestDatabase {
    /// Connection string accepted by `sqlx` and other Postgres clients.
    #[must_use]
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        if let Some(owner) = &self.owner {
            let _ = run_admin_statement(
                &owner.admin_url,
                format!("DROP DATABASE IF EXISTS \"{}\"", owner.database),
            );
        }
    }
}

impl Drop for LocalServer {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
        let _ = fs::remove_dir_all(&self.data_dir);
    }
}

/// Provision a fresh database.
///
/// # Errors
///
/// Returns an error when no server URL is configured and local Postgres
/// binaries are missing or fail to start.
pub fn start_postgres() -> Result<TestDatabase> {
    if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
        let (connection_string, owner) = create_database_on(&url)?;
        return Ok(TestDatabase {
            connection_string,
            owner: Some(owner),
            server: None,
        });
    }

    let bin_dir = locate_bin_dir()?;
    let port = free_port()?;
    let data_dir = scratch_dir()?;

    let status = Command::new(bin_dir.join("initdb"))
        .arg("-D")
        .arg(&data_dir)
        .args(["--username=postgres", "--auth=trust"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("failed to run initdb")?;
    if !status.success() {
        let _ = fs::remove_dir_all(&data_dir);
        bail!("initdb exited with failure status");
    }

    let process = Command::new(bin_dir.join("postgres"))
        .arg("-D")
        .arg(&data_dir)
        .args(["-p", &port.to_string(), "-h", "127.0.0.1"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to start postgres process")?;
    let server = LocalServer { process, data_dir };

    wait_until_ready(&bin_dir, port)?;

    let base_url = format!("postgres://postgres@127.0.0.1:{port}/postgres");
    let (connection_string, owner) = create_database_on(&base_url)?;
    Ok(TestDatabase {
        connection_string,
        owner: Some(owner),
        server: Some(server),
    })
}

fn locate_bin_dir() -> Result<PathBuf> {
    let mut candidates = vec![
        PathBuf::from("/opt/homebrew/opt/postgresql@16/bin"),
        PathBuf::from("/usr/local/opt/postgresql@16/bin"),
    ];
    if let Some(paths) = std::env::var_os("PATH") {
        candidates.extend(std::env::split_paths(&paths));
    }
    candidates.extend(
        ["/usr/lib/postgresql/16/bin", "/usr/local/bin", "/opt/homebrew/bin"]
            .into_iter()
            .map(PathBuf::from),
    );

    candidates
        .into_iter()
        .find(|dir| has_server_binaries(dir))
        .ok_or_else(|| anyhow!("initdb, postgres and pg_isready are required for Postgres tests"))
}

fn has_server_binaries(dir: &Path) -> bool {
    ["initdb", "postgres", "pg_isready"]
        .iter()
        .all(|name| dir.join(name).exists())
}

fn free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("failed to reserve port")?;
    Ok(listener
        .local_addr()
        .context("failed to read listener address")?
        .port())
}

fn unique_suffix() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{}_{nanos}", std::process::id())
}

fn scratch_dir() -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("authplane-pg-{}", unique_suffix()));
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create data dir {}", dir.display()))?;
    Ok(dir)
}

fn wait_until_ready(bin_dir: &Path, port: u16) -> Result<()> {
    let port = port.to_string();
    for _ in 0..30 {
        let ready = Command::new(bin_dir.join("pg_isready"))
            .args(["-h", "127.0.0.1", "-p", &port, "-U", "postgres"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success());
        if ready {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(200));
    }
    bail!("postgres process did not become ready in time")
}

fn create_database_on(base_url: &str) -> Result<(String, AdminHandle)> {
    let parsed = Url::parse(base_url).context("invalid postgres connection url")?;
    let database = format!("authplane_test_{}", unique_suffix());

    let mut admin = parsed.clone();
    admin.set_path("/postgres");
    let mut admin_urls = vec![admin.to_string()];
    if admin.path() != parsed.path() {
        admin_urls.push(parsed.to_string());
    }

    let mut last_error = None;
    for admin_url in admin_urls {
        match run_admin_statement(&admin_url, format!("CREATE DATABASE \"{database}\"")) {
            Ok(()) => {
                let mut target = parsed.clone();
                target.set_path(&format!("/{database}"));
                return Ok((
                    target.to_string(),
                    AdminHandle {
                        admin_url,
                        database,
                    },
                ));
            }
            Err(err) => last_error = Some(err),
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow!("failed to create database")))
}

// The blocking client spins up its own runtime, so keep it off any async worker.
fn run_admin_statement(admin_url: &str, statement: String) -> Result<()> {
    let admin_url = admin_url.to_string();
    thread::spawn(move || -> Result<()> {
        let mut client = postgres::Config::from_str(&admin_url)?.connect(NoTls)?;
        client
            .simple_query(&statement)
            .map(|_| ())
            .with_context(|| format!("failed to run `{statement}`"))
    })
    .join()
    .unwrap_or_else(|_| Err(anyhow!("admin statement thread panicked")))
}
