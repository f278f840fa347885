use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use strongbox::auth::UserAuth;
use strongbox::block_codec::BLOCK_SIZE;
use strongbox::collaborators::Collaborators;
use strongbox::config::{self, Config};
use strongbox::lifetime::Lifetime;
use strongbox::model::{AccessLevel, File, FileKind, Role, RoleSet};
use strongbox::service::{Service, Services};
use strongbox::store::Stored;
use strongbox::stream::OpenStream;

/// Strongbox - end-to-end encrypted multi-user file storage
#[derive(Parser)]
#[command(name = "strongbox")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "strongbox.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a configuration file
    Init {
        /// Store image path
        #[arg(short, long, default_value = "./strongbox.db")]
        data_path: String,

        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:7070")]
        listen: String,
    },

    /// Accept connections until interrupted
    Serve,

    /// Register a user
    AddUser {
        username: String,

        /// Grant the admin role
        #[arg(long)]
        admin: bool,
    },

    /// Upload a local file into a user's tree
    Import {
        username: String,

        /// Local file to upload
        input: PathBuf,

        /// Destination folder path in the user's tree
        #[arg(short, long, default_value = "/")]
        folder: String,

        /// Name in the tree (defaults to the input filename)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Read a file from a user's tree
    Export {
        username: String,

        /// File path in the user's tree, e.g. /docs/report.pdf
        path: String,

        /// Output file path (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List a folder in a user's tree
    List {
        username: String,

        #[arg(default_value = "/")]
        path: String,
    },

    /// Show store statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Use RUST_LOG to control log level (e.g., RUST_LOG=info,strongbox=debug)
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    info!(command = ?cli.command, "Strongbox starting");

    match cli.command {
        Commands::Init { data_path, listen } => cmd_init(&cli.config, data_path, listen).await,
        Commands::Serve => cmd_serve(&cli.config).await,
        Commands::AddUser { username, admin } => cmd_add_user(&cli.config, &username, admin).await,
        Commands::Import {
            username,
            input,
            folder,
            name,
        } => cmd_import(&cli.config, &username, &input, &folder, name.as_deref()).await,
        Commands::Export {
            username,
            path,
            output,
        } => cmd_export(&cli.config, &username, &path, output.as_ref()).await,
        Commands::List { username, path } => cmd_list(&cli.config, &username, &path).await,
        Commands::Status => cmd_status(&cli.config).await,
    }
}

/// Create a styled progress bar for uploads
fn create_progress_bar(total: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({percent}%) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("#>-");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Password from STRONGBOX_PASSWORD, or prompted on stdin
fn read_password(prompt: &str) -> Result<String> {
    if let Ok(password) = std::env::var("STRONGBOX_PASSWORD") {
        return Ok(password);
    }
    print!("{}: ", prompt);
    io::stdout().flush()?;
    let mut password = String::new();
    io::stdin().read_line(&mut password)?;
    Ok(password.trim_end_matches(&['\r', '\n'][..]).to_string())
}

async fn open_service(config_path: &str) -> Result<(Config, Service)> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let service = Service::open(cfg.clone(), Collaborators::default()).await?;
    Ok((cfg, service))
}

async fn save(cfg: &Config, service: &Service) -> Result<()> {
    if let Some(path) = &cfg.data_path {
        service.storage().save(path, cfg.compress_image).await?;
    }
    Ok(())
}

/// Log `username` in and return their opened identity.
async fn sign_in(services: &Services, username: &str) -> Result<UserAuth> {
    let password = read_password(&format!("Password for {}", username))?;
    let tx = services.storage.db.begin(&Lifetime::new()).await?;
    let grant = services.accounts.login(&tx, username, &password)?;
    let auth = services
        .accounts
        .resolve_session(&tx, grant.session_id, &grant.session_key)?;
    services.accounts.logout(&tx, grant.session_id)?;
    tx.commit();
    Ok(auth)
}

/// Walk a `/`-separated path from the user's root.
fn resolve_path(services: &Services, auth: &UserAuth, path: &str) -> Result<Stored<File>> {
    let mut current = services.tree.root_of(None, auth.user_id)?;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let children = services.tree.list_children(None, current.id, auth)?;
        current = children
            .into_iter()
            .find(|child| child.name.eq_ignore_ascii_case(segment))
            .with_context(|| format!("'{}' not found in {}", segment, path))?;
    }
    Ok(current)
}

/// Write a configuration file
async fn cmd_init(config_path: &str, data_path: String, listen: String) -> Result<()> {
    println!("Initializing Strongbox...");

    if fs::try_exists(config_path).await.unwrap_or(false) {
        anyhow::bail!(
            "Configuration file '{}' already exists. Remove it first or use a different path.",
            config_path
        );
    }

    let cfg = Config {
        data_path: Some(data_path),
        listen_addr: listen,
        ..Config::default()
    };
    cfg.validate()?;
    cfg.save(config_path)?;

    println!("Initialization complete!");
    println!("Config:  {}", config_path);
    println!("Store:   {}", cfg.data_path.as_deref().unwrap_or("(memory)"));
    println!("Listen:  {}", cfg.listen_addr);
    println!();
    println!("Next: strongbox add-user <name> --admin");

    Ok(())
}

/// Accept connections until Ctrl-C
async fn cmd_serve(config_path: &str) -> Result<()> {
    let (cfg, service) = open_service(config_path).await?;
    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.listen_addr))?;

    service.start();
    println!("Listening on {} (Ctrl-C to stop)", cfg.listen_addr);

    tokio::select! {
        served = service.serve(listener) => served?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            info!("interrupt received, shutting down");
        }
    }

    service.stop().await?;
    println!("Stopped.");
    Ok(())
}

/// Register a user
async fn cmd_add_user(config_path: &str, username: &str, admin: bool) -> Result<()> {
    let (cfg, service) = open_service(config_path).await?;
    let services = service.services();

    let password = read_password(&format!("New password for {}", username))?;
    let roles = if admin {
        RoleSet::of(&[Role::Member, Role::Admin])
    } else {
        RoleSet::of(&[Role::Member])
    };

    let tx = services.storage.db.begin(&Lifetime::new()).await?;
    let auth = services
        .accounts
        .register_user(&tx, username, &password, roles)?;
    tx.commit();
    save(&cfg, &service).await?;

    println!("Created user '{}' (id {})", auth.username, auth.user_id);
    if admin {
        println!("  with the admin role");
    }
    Ok(())
}

/// Upload a local file through a write stream
async fn cmd_import(
    config_path: &str,
    username: &str,
    input: &PathBuf,
    folder: &str,
    name: Option<&str>,
) -> Result<()> {
    let (cfg, service) = open_service(config_path).await?;
    let services = service.services();
    let auth = sign_in(services, username).await?;

    let name = match name {
        Some(name) => name.to_string(),
        None => input
            .file_name()
            .context("input file has no filename")?
            .to_string_lossy()
            .to_string(),
    };
    let parent = resolve_path(services, &auth, folder)?;

    let input_size = fs::metadata(input)
        .await
        .with_context(|| format!("reading metadata for {:?}", input))?
        .len();

    let tx = services.storage.db.begin(&Lifetime::new()).await?;
    let file = services
        .tree
        .create(&tx, Some(parent.id), &name, FileKind::File, &auth)?;
    let unlocked = services
        .tree
        .open(Some(&tx), file.id, &auth, AccessLevel::ReadWrite)?;
    let content = services.tree.get_main_content(&tx, &file)?;
    tx.commit();

    let handle = services.streams.open(
        OpenStream {
            unlocked,
            content,
            snapshot_id: None,
            auth: auth.clone(),
            new_file: true,
        },
        Lifetime::new(),
    );

    let pb = create_progress_bar(input_size, "Importing");
    let mut reader = fs::File::open(input)
        .await
        .with_context(|| format!("opening {:?}", input))?;
    let mut chunk = vec![0u8; BLOCK_SIZE.min(services.streams.limits().max_chunk)];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let written = handle.write(chunk[..n].to_vec()).await?;
        pb.set_position(written.position);
    }
    let info = handle.close().await?;
    pb.finish_with_message(format!("Imported {} bytes", info.size));

    save(&cfg, &service).await?;
    println!("  {} -> {}", input.display(), services.tree.file_path(None, file.id, &auth)?);
    Ok(())
}

/// Read a file out of a user's tree
async fn cmd_export(
    config_path: &str,
    username: &str,
    path: &str,
    output: Option<&PathBuf>,
) -> Result<()> {
    let (_, service) = open_service(config_path).await?;
    let services = service.services();
    let auth = sign_in(services, username).await?;

    let file = resolve_path(services, &auth, path)?;
    if file.kind != FileKind::File {
        anyhow::bail!("'{}' is a folder", path);
    }

    let spinner = create_spinner(&format!("Decrypting {}...", path));
    let unlocked = services.tree.open(None, file.id, &auth, AccessLevel::Read)?;

    let mut file_out = match output {
        Some(output_path) => Some(
            fs::File::create(output_path)
                .await
                .with_context(|| format!("creating {:?}", output_path))?,
        ),
        None => None,
    };
    let mut total = 0u64;
    loop {
        let chunk = services.tree.read_main_at(None, &unlocked, total, BLOCK_SIZE)?;
        if chunk.is_empty() {
            break;
        }
        match file_out.as_mut() {
            Some(out) => out.write_all(&chunk).await?,
            None => io::stdout().write_all(&chunk)?,
        }
        total += chunk.len() as u64;
    }

    match (file_out, output) {
        (Some(mut out), Some(output_path)) => {
            out.flush().await?;
            spinner.finish_with_message(format!("Decrypted {} bytes -> {:?}", total, output_path));
        }
        _ => {
            spinner.finish_and_clear();
            io::stdout().flush()?;
            eprintln!("Decrypted {} bytes to stdout", total);
        }
    }
    Ok(())
}

/// List a folder
async fn cmd_list(config_path: &str, username: &str, path: &str) -> Result<()> {
    let (_, service) = open_service(config_path).await?;
    let services = service.services();
    let auth = sign_in(services, username).await?;

    let folder = resolve_path(services, &auth, path)?;
    let children = services.tree.list_children(None, folder.id, &auth)?;
    if children.is_empty() {
        println!("{} is empty", path);
        return Ok(());
    }

    println!("{:<40} {:>8} {:>14}", "NAME", "KIND", "SIZE (bytes)");
    println!("{}", "-".repeat(64));
    for child in children {
        let size = match child.kind {
            FileKind::Folder => String::new(),
            FileKind::File => services
                .tree
                .find_main_content(None, child.id)
                .and_then(|content| services.tree.latest_snapshot(None, content.id))
                .map(|snapshot| snapshot.size.to_string())
                .unwrap_or_else(|| "0".to_string()),
        };
        println!("{:<40} {:>8} {:>14}", child.name, child.kind.to_string(), size);
    }
    Ok(())
}

/// Show store statistics
async fn cmd_status(config_path: &str) -> Result<()> {
    let (cfg, service) = open_service(config_path).await?;
    let stats = service.storage().stats();

    println!("Strongbox Status");
    println!();

    println!("Configuration:");
    println!("  Config file:   {}", config_path);
    println!("  Store image:   {}", cfg.data_path.as_deref().unwrap_or("(memory)"));
    println!("  Listen:        {}", cfg.listen_addr);
    println!(
        "  Session idle:  {}s (env {})",
        cfg.session_idle_timeout_secs,
        config::ENV_SESSION_IDLE
    );
    println!();

    println!("Store Statistics:");
    println!("  Users:         {}", stats.users);
    println!("  Files:         {}", stats.files);
    println!("  Snapshots:     {}", stats.snapshots);
    println!(
        "  Blocks:        {} ({:.2} MB encrypted)",
        stats.blocks,
        stats.block_bytes as f64 / 1_048_576.0
    );

    Ok(())
}
