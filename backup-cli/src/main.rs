// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! `backupctl`: export, restore and inspect message backups of a local store.

use std::{
    io::IsTerminal,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use backup_archive::{
    forward_secrecy::read_metadata_header,
    local_store::generate_profile_key,
    prelude::*,
    settings::LastBackup,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secret_recovery::prelude::{AccountCredentials, HttpSecretRecoveryClient, SvrClientConfig};
use serde::Serialize;
use tracing::{info, warn};

mod logging;
use logging::init_logging;

type Manager = BackupArchiveManager<HttpSecretRecoveryClient, LocalDirectoryTransport>;

#[derive(Debug, Parser)]
#[command(name = "backupctl", version)]
#[command(about = "Export, restore and inspect encrypted message backups", long_about = None)]
struct Cli {
    /// Local store database
    #[arg(long, env = "BACKUP_DB", default_value = "messages.db", global = true)]
    db: PathBuf,

    /// Service id of the local account, e.g. 5b3c1a6e-0000-4000-8000-000000000001
    #[arg(long, env = "BACKUP_ACI", global = true)]
    aci: Option<String>,

    /// Phone number of the local account
    #[arg(long, env = "BACKUP_E164", global = true)]
    e164: Option<String>,

    /// Secret recovery service URL
    #[arg(long, env = "BACKUP_SVR_URL", global = true)]
    svr_url: Option<String>,

    /// Account user name for the secret recovery service
    #[arg(long, env = "BACKUP_SVR_USER", global = true)]
    svr_user: Option<String>,

    /// Account password for the secret recovery service
    #[arg(long, env = "BACKUP_SVR_PASSWORD", hide_env_values = true, global = true)]
    svr_password: Option<String>,

    /// Directory that holds uploaded archives
    #[arg(long, env = "BACKUP_DIR", default_value = "backups", global = true)]
    backup_dir: PathBuf,

    /// Print machine-readable output
    #[arg(long, global = true)]
    json: bool,

    /// Verbose mode (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the local account in an empty store
    Init {
        /// Given name of the local account
        #[arg(long)]
        given_name: String,

        /// Profile key (hex, 32 bytes). Default: random
        #[arg(long)]
        profile_key: Option<String>,
    },

    /// Export the store. Remote backups are uploaded unless --no-upload is given
    Export(ExportArgs),

    /// Restore an archive into an empty store
    Import(ImportArgs),

    /// Schedule deferred restore work after an import
    Finalize,

    /// Check an archive without importing it
    Validate(ValidateArgs),

    /// Print the metadata header of an encrypted archive
    Header {
        /// Archive file
        path: PathBuf,
    },

    /// Show restore state and the last backup
    Status,

    /// Print a summary of the store contents
    Snapshot,
}

#[derive(Debug, Args)]
struct KeyArgs {
    /// Backup key (hex) for remote backups
    #[arg(long, env = "BACKUP_KEY", hide_env_values = true, conflicts_with = "transfer_key")]
    backup_key: Option<String>,

    /// One-time device transfer key (hex)
    #[arg(long)]
    transfer_key: Option<String>,

    /// Forward secrecy token (hex) handed over by another device; skips the restore call
    #[arg(long, requires = "backup_key")]
    cached_token: Option<String>,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[command(flatten)]
    keys: KeyArgs,

    /// Write an unencrypted archive to this path instead
    #[arg(long, value_name = "PATH")]
    plaintext: Option<PathBuf>,

    /// Content rules for a plaintext export
    #[arg(long, value_enum, default_value_t = PurposeArg::RemoteBackup)]
    purpose: PurposeArg,

    /// Keep the encrypted archive in the staging directory
    #[arg(long)]
    no_upload: bool,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[command(flatten)]
    keys: KeyArgs,

    /// Archive to import. Remote backups are downloaded when omitted
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,

    /// The archive is not encrypted
    #[arg(long, requires = "file")]
    plaintext: bool,

    /// Content rules for a plaintext import
    #[arg(long, value_enum, default_value_t = PurposeArg::RemoteBackup)]
    purpose: PurposeArg,

    /// Finalize right after a successful import
    #[arg(long)]
    finalize: bool,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    /// Archive file
    path: PathBuf,

    #[command(flatten)]
    keys: KeyArgs,

    /// The archive is not encrypted
    #[arg(long)]
    plaintext: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PurposeArg {
    RemoteBackup,
    DeviceTransfer,
}

impl From<PurposeArg> for BackupPurpose {
    fn from(purpose: PurposeArg) -> Self {
        match purpose {
            PurposeArg::RemoteBackup => Self::RemoteBackup,
            PurposeArg::DeviceTransfer => Self::DeviceTransfer,
        }
    }
}

fn decode_hex(what: &str, text: &str) -> Result<Vec<u8>> {
    hex::decode(text.trim()).with_context(|| format!("{what} is not valid hex"))
}

impl KeyArgs {
    fn source(&self) -> Result<KeySource> {
        match (&self.backup_key, &self.transfer_key) {
            (Some(key), None) => {
                let backup_key = BackupKey::from_bytes(&decode_hex("backup key", key)?)?;
                let cached_token = match &self.cached_token {
                    Some(token) => Some(ForwardSecrecyToken::from_bytes(&decode_hex(
                        "cached token",
                        token,
                    )?)?),
                    None => None,
                };
                Ok(KeySource::RemoteBackup {
                    backup_key,
                    cached_token,
                })
            }
            (None, Some(key)) => Ok(KeySource::DeviceTransfer {
                ephemeral: EphemeralBackupKey::from_bytes(&decode_hex("transfer key", key)?)?,
            }),
            _ => bail!("one of --backup-key or --transfer-key is required"),
        }
    }
}

impl Cli {
    fn local(&self) -> Result<LocalIdentifiers> {
        let aci = self.aci.as_deref().context("--aci (or BACKUP_ACI) is required")?;
        Ok(LocalIdentifiers::new(aci, self.e164.as_deref()))
    }

    fn open_store(&self) -> Result<LocalStore> {
        LocalStore::open(&self.db).with_context(|| format!("opening {}", self.db.display()))
    }

    fn manager(&self, store: &LocalStore) -> Result<Manager> {
        let mut svr_config = SvrClientConfig::default();
        if let Some(url) = &self.svr_url {
            svr_config = svr_config.base_url(url);
        }
        let svr = HttpSecretRecoveryClient::with_config(svr_config)?;
        if let (Some(username), Some(password)) = (&self.svr_user, &self.svr_password) {
            svr.set_account(AccountCredentials {
                username: username.clone(),
                password: password.clone(),
            });
        }
        Ok(BackupArchiveManager::new(
            store.connection(),
            store.archivers(),
            store.hooks(),
            svr,
            LocalDirectoryTransport::new(self.backup_dir.clone()),
            ManagerConfig::from_env()?,
        ))
    }
}

// ----------------------------------------------------------------------------
// output
// ----------------------------------------------------------------------------

fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    println!("{text}");
    Ok(())
}

fn print_report(report: &ErrorReport) {
    if report.is_empty() {
        return;
    }
    println!(
        "  {} frame error(s), worst: {}{}",
        report.error_count,
        report
            .max_level
            .map_or_else(|| "none".to_string(), |level| level.to_string()),
        if report.dropped_frames { ", frames dropped" } else { "" }
    );
}

fn progress_enabled(json: bool, stderr_is_tty: bool) -> bool {
    !json && stderr_is_tty
}

const PROGRESS_SCALE: u64 = 1000;

struct ProgressReporter {
    bar: Option<ProgressBar>,
}

impl ProgressReporter {
    fn new(json: bool, message: &str) -> Self {
        if !progress_enabled(json, std::io::stderr().is_terminal()) {
            return Self { bar: None };
        }
        let bar = ProgressBar::new(PROGRESS_SCALE);
        let style = ProgressStyle::with_template("{spinner:.green} {msg} [{bar:40}] {percent}%")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.enable_steady_tick(std::time::Duration::from_millis(120));
        bar.set_message(message.to_string());
        Self { bar: Some(bar) }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn sink(&self) -> Option<Arc<dyn ProgressSink>> {
        let bar = self.bar.clone()?;
        Some(Arc::new(move |update: ProgressUpdate| {
            bar.set_position((update.overall * PROGRESS_SCALE as f64).round() as u64);
            bar.set_message(update.phase.to_string());
        }))
    }

    fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

/// Cancels the returned token on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            token.cancel();
        }
    });
    cancel
}

// ----------------------------------------------------------------------------
// commands
// ----------------------------------------------------------------------------

fn init(cli: &Cli, given_name: &str, profile_key: Option<&str>) -> Result<()> {
    let local = cli.local()?;
    let profile_key = match profile_key {
        Some(text) => decode_hex("profile key", text)?,
        None => generate_profile_key().to_vec(),
    };
    let store = cli.open_store()?;
    store.init_account(&local, &profile_key, given_name)?;
    info!(db = %cli.db.display(), "account initialized");
    if cli.json {
        emit_json(&serde_json::json!({ "db": cli.db, "aci": local.aci.as_str() }))
    } else {
        println!("initialized {} for {}", cli.db.display(), local.aci);
        Ok(())
    }
}

#[derive(Serialize)]
struct ExportReport<'a> {
    #[serde(flatten)]
    metadata: &'a EncryptedBackupUploadMetadata,
    upload: Option<UploadReceipt>,
}

async fn export(cli: &Cli, args: &ExportArgs) -> Result<()> {
    let local = cli.local()?;
    let store = cli.open_store()?;
    let manager = cli.manager(&store)?;
    let cancel = cancel_on_ctrl_c();
    let progress = ProgressReporter::new(cli.json, "exporting");

    if let Some(path) = &args.plaintext {
        let outcome = manager
            .export_plaintext_backup(path, &local, args.purpose.into(), progress.sink(), &cancel)
            .await;
        progress.finish();
        let outcome = outcome?;
        if cli.json {
            return emit_json(&outcome);
        }
        println!(
            "exported {} frames to {} ({} bytes)",
            outcome.frame_count,
            outcome.path.display(),
            outcome.file_len
        );
        print_report(&outcome.report);
        return Ok(());
    }

    let source = args.keys.source()?;
    let metadata = manager
        .export_encrypted_backup(&local, &source, progress.sink(), &cancel)
        .await;
    progress.finish();
    let metadata = metadata?;
    let upload = if args.no_upload || metadata.backup_id.is_none() {
        if metadata.rotation.is_some() {
            warn!("archive not uploaded; the secret chain was not advanced");
        }
        None
    } else {
        Some(manager.upload_encrypted_backup(&metadata, &cancel).await?)
    };

    if cli.json {
        return emit_json(&ExportReport {
            metadata: &metadata,
            upload,
        });
    }
    println!(
        "exported {} ({} bytes, sha256 {})",
        metadata.path.display(),
        metadata.encrypted_len,
        metadata.sha256
    );
    print_report(&metadata.report);
    if let Some(receipt) = upload {
        println!("uploaded to {}", receipt.location);
    }
    Ok(())
}

#[derive(Serialize)]
struct ImportReport {
    #[serde(flatten)]
    outcome: ImportOutcome,
    finalize: Option<FinalizeOutcome>,
}

async fn import(cli: &Cli, args: &ImportArgs) -> Result<()> {
    let local = cli.local()?;
    let store = cli.open_store()?;
    let manager = cli.manager(&store)?;
    let cancel = cancel_on_ctrl_c();

    let outcome = if args.plaintext {
        let path = args.file.as_deref().context("--file is required with --plaintext")?;
        let progress = ProgressReporter::new(cli.json, "importing");
        let outcome = manager
            .import_plaintext_backup(path, &local, args.purpose.into(), progress.sink(), &cancel)
            .await;
        progress.finish();
        outcome?
    } else {
        let source = args.keys.source()?;
        let path = match (&args.file, &source) {
            (Some(path), _) => path.clone(),
            (None, KeySource::RemoteBackup { backup_key, .. }) => manager
                .download_encrypted_backup(&local, backup_key, &cancel)
                .await
                .context("downloading backup")?,
            (None, KeySource::DeviceTransfer { .. }) => {
                bail!("--file is required for device transfer archives")
            }
        };
        let progress = ProgressReporter::new(cli.json, "importing");
        let outcome = manager
            .import_encrypted_backup(&path, &local, &source, progress.sink(), &cancel)
            .await;
        progress.finish();
        outcome?
    };

    let finalize = if args.finalize {
        Some(manager.finalize_backup_import(&cancel).await?)
    } else {
        None
    };

    if cli.json {
        return emit_json(&ImportReport { outcome, finalize });
    }
    println!(
        "restored {} of {} frames, {} thread(s) indexed",
        outcome.frames_restored, outcome.frames_read, outcome.threads_indexed
    );
    print_report(&outcome.report);
    match finalize {
        Some(done) => println!(
            "finalized: {} avatar and {} attachment job(s) scheduled",
            done.avatar_jobs_enqueued, done.attachment_jobs_enqueued
        ),
        None => println!("run `backupctl finalize` to schedule attachment downloads"),
    }
    Ok(())
}

async fn finalize(cli: &Cli) -> Result<()> {
    let store = cli.open_store()?;
    let manager = cli.manager(&store)?;
    let outcome = manager.finalize_backup_import(&cancel_on_ctrl_c()).await?;
    if cli.json {
        return emit_json(&outcome);
    }
    if outcome.already_finalized {
        println!("already finalized");
    } else {
        println!(
            "finalized: {} avatar and {} attachment job(s) scheduled",
            outcome.avatar_jobs_enqueued, outcome.attachment_jobs_enqueued
        );
    }
    Ok(())
}

async fn validate(cli: &Cli, args: &ValidateArgs) -> Result<()> {
    let store = cli.open_store()?;
    let manager = cli.manager(&store)?;
    let report = if args.plaintext {
        manager.validate_plaintext_backup(&args.path).await?
    } else {
        let local = cli.local()?;
        let source = args.keys.source()?;
        manager
            .validate_encrypted_backup(&args.path, &local, &source, &cancel_on_ctrl_c())
            .await?
    };
    if cli.json {
        return emit_json(&report);
    }
    println!(
        "valid: version {}, {} frames, created at {} ms",
        report.version, report.frame_count, report.backup_time_ms
    );
    Ok(())
}

async fn header(cli: &Cli, path: &Path) -> Result<()> {
    let header = read_metadata_header(path)
        .await
        .with_context(|| format!("reading header of {}", path.display()))?;
    if cli.json {
        return emit_json(&serde_json::json!({
            "len": header.len,
            "body": hex::encode(&header.body),
        }));
    }
    println!("header length {} bytes", header.len);
    println!("metadata {}", hex::encode(&header.body));
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusReport {
    restore_state: BackupRestoreState,
    has_forward_secrecy_token: bool,
    last_backup: Option<LastBackup>,
}

async fn status(cli: &Cli) -> Result<()> {
    let store = cli.open_store()?;
    let manager = cli.manager(&store)?;
    let report = StatusReport {
        restore_state: manager.backup_restore_state().await?,
        has_forward_secrecy_token: manager.cached_forward_secrecy_token().await?.is_some(),
        last_backup: manager.last_backup().await?,
    };
    if cli.json {
        return emit_json(&report);
    }
    println!("restore state: {}", report.restore_state);
    println!("forward secrecy token cached: {}", report.has_forward_secrecy_token);
    match report.last_backup {
        Some(last) => println!("last backup: {} bytes at {} ms", last.size_bytes, last.time_ms),
        None => println!("last backup: never"),
    }
    Ok(())
}

fn snapshot(cli: &Cli) -> Result<()> {
    let snapshot = cli.open_store()?.snapshot()?;
    if cli.json {
        return emit_json(&snapshot);
    }
    println!("account: {}", snapshot.account_given_name.as_deref().unwrap_or("-"));
    println!("recipients: {}", snapshot.recipients.len());
    println!("threads: {}", snapshot.threads.len());
    println!("messages: {}", snapshot.messages.len());
    println!("attachments: {}", snapshot.attachments.len());
    println!("sticker packs: {}", snapshot.sticker_packs);
    println!("calls: {}", snapshot.calls);
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Init {
            given_name,
            profile_key,
        } => init(&cli, given_name, profile_key.as_deref()),
        Commands::Export(args) => export(&cli, args).await,
        Commands::Import(args) => import(&cli, args).await,
        Commands::Finalize => finalize(&cli).await,
        Commands::Validate(args) => validate(&cli, args).await,
        Commands::Header { path } => header(&cli, path).await,
        Commands::Status => status(&cli).await,
        Commands::Snapshot => snapshot(&cli),
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<BackupError>() {
        Some(BackupError::Cancelled) => 130,
        Some(BackupError::AlreadyRestored { .. } | BackupError::NotRestored) => 2,
        Some(BackupError::Validation { .. }) => 3,
        _ => 1,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_logging(cli.debug, cli.verbose) {
        eprintln!("logging: {err}");
    }
    if let Err(err) = run(cli).await {
        let code = exit_code(&err);
        eprintln!("error: {err:#}");
        std::process::exit(code);
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn export_args_parse() {
        let key = "ab".repeat(32);
        let cli = Cli::try_parse_from([
            "backupctl",
            "--aci",
            "5b3c1a6e-0000-4000-8000-000000000001",
            "export",
            "--backup-key",
            key.as_str(),
            "--no-upload",
        ])
        .expect("parse");
        let Commands::Export(args) = &cli.command else {
            panic!("expected export");
        };
        assert!(args.no_upload);
        assert!(matches!(
            args.keys.source().expect("source"),
            KeySource::RemoteBackup {
                cached_token: None,
                ..
            }
        ));
        assert_eq!(cli.local().expect("local").aci.as_str(), "5b3c1a6e-0000-4000-8000-000000000001");
    }

    #[test]
    fn key_arguments_are_exclusive() {
        let both = Cli::try_parse_from([
            "backupctl",
            "export",
            "--backup-key",
            "00",
            "--transfer-key",
            "00",
        ]);
        assert!(both.is_err());

        let none = KeyArgs {
            backup_key: None,
            transfer_key: None,
            cached_token: None,
        };
        assert!(none.source().is_err());

        let bad_hex = KeyArgs {
            backup_key: Some("zz".to_string()),
            transfer_key: None,
            cached_token: None,
        };
        assert!(bad_hex.source().is_err());
    }

    #[test]
    fn plaintext_import_requires_file() {
        assert!(Cli::try_parse_from(["backupctl", "import", "--plaintext"]).is_err());
        assert!(Cli::try_parse_from(["backupctl", "import", "--plaintext", "--file", "a.bin"]).is_ok());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(exit_code(&anyhow::Error::new(BackupError::Cancelled)), 130);
        assert_eq!(exit_code(&anyhow::Error::new(BackupError::NotRestored)), 2);
        assert_eq!(
            exit_code(&anyhow::Error::new(BackupError::NotRestored).context("finalizing")),
            2
        );
        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
    }

    #[test]
    fn progress_only_on_a_terminal() {
        assert!(progress_enabled(false, true));
        assert!(!progress_enabled(true, true));
        assert!(!progress_enabled(false, false));
        assert!(ProgressReporter::new(true, "hidden").sink().is_none());
    }
}
