use std::{path::Path, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use trellis::{
    AppConfig, GracefulShutdown, HttpHandler, MemorySessionStore, Multiplexer,
    TracingAccessLogger,
    config::{AppConfigValidator, loader},
    tracing_setup,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Serve the configured static directories (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve_command(&config).await,
        None => serve_command(&args.config).await,
    }
}

async fn load_app_config(config_path: &str) -> Result<AppConfig> {
    if Path::new(config_path).exists() {
        loader::load_config(config_path)
            .await
            .with_context(|| format!("Failed to load config from {config_path}"))
    } else {
        loader::load_env_only().context("Failed to load config from environment")
    }
}

async fn serve_command(config_path: &str) -> Result<()> {
    let config = load_app_config(config_path).await?;
    AppConfigValidator::validate(&config)
        .map_err(|e| eyre!("Invalid configuration in {config_path}: {e}"))?;

    tracing_setup::init_tracing_with_config(&config.log)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    if !Path::new(config_path).exists() {
        tracing::warn!("{config_path} not found, using defaults and environment overrides");
    }

    let shutdown = GracefulShutdown::with_timeout(config.shutdown_timeout());
    let signal_handler = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler.run_signal_handler().await {
            tracing::error!("Signal handler error: {:?}", e);
        }
    });

    let mut builder = Multiplexer::builder(config.clone());
    if config.log.access_logs {
        builder = builder.access_logger(Arc::new(TracingAccessLogger::new(
            config.log.access_log_format,
        )));
    }
    let mut session_gc = None;
    if config.web.session.enabled {
        let store = Arc::new(MemorySessionStore::new(config.web.session.clone()));
        let interval = Duration::from_secs(config.web.session.gc_max_lifetime_secs.max(1));
        session_gc = Some(store.clone().spawn_gc(interval));
        builder = builder.sessions(store);
    }
    let multiplexer = Arc::new(builder.build());

    for dir in &config.static_files.dirs {
        tracing::info!("Static prefix {} -> {}", dir.prefix, dir.dir);
    }
    tracing::info!(
        "Starting {} ({}) on {}",
        config.app_name,
        config.env_mode,
        config.listen_addr
    );

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;

    let result = trellis::serve(listener, HttpHandler::new(multiplexer), shutdown).await;

    if let Some(handle) = session_gc {
        handle.abort();
    }
    result
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match loader::load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match AppConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Environment: {}", config.env_mode);
            println!("   • Static Prefixes: {}", config.static_files.dirs.len());
            println!(
                "   • Static Cache: {} files up to {} bytes",
                config.static_files.cache_file_num, config.static_files.cache_file_size
            );
            println!("   • CSRF Protection: {}", config.web.enable_xsrf);
            println!("   • Sessions: {}", config.web.session.enabled);
            println!(
                "   • 405 on Method Mismatch: {}",
                config.router.method_not_allowed
            );
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Verify listen address format (e.g., '127.0.0.1:7000')");
            println!("   • Static prefixes must start with '/' and be unique");
            println!("   • Set web.xsrf_key when CSRF protection is enabled");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Trellis configuration

app_name = "trellis"
# development renders diagnostic pages for handler faults
env_mode = "development"
listen_addr = "127.0.0.1:7000"
shutdown_timeout = "30s"

# Request body admission
copy_request_body = false
max_memory = 67108864
max_upload_size = 1073741824

[router]
# Answer 405 + Allow instead of 404 when only the method did not match
method_not_allowed = false

[static_files]
public_dir = "public"
directory_index = false
enable_gzip = true
gzip_extensions = [".css", ".js"]
cache_file_size = 102400
cache_file_num = 1000

[[static_files.dirs]]
prefix = "/static"
dir = "static"

[web]
enable_xsrf = false
xsrf_key = "change-me"
xsrf_expire = 3600

[web.session]
enabled = false
cookie_name = "trellis_session"

[log]
level = "info"
json = false
access_logs = true
enable_static_logs = false
access_log_format = "apache"
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'trellis serve --config {config_path}' to start the server");
    Ok(())
}
