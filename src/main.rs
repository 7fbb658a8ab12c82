use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use crpy::commands::cache::CacheOptions;
use crpy::commands::inspect::InspectOptions;
use crpy::commands::login::{LoginOptions, LogoutOptions};
use crpy::commands::pull::PullOptions;
use crpy::commands::push::PushOptions;
use crpy::commands::settings::SettingsOptions;
use crpy::commands::{
    execute_cache, execute_inspect, execute_layers, execute_login, execute_logout,
    execute_manifest, execute_pull, execute_push, execute_settings,
};
use crpy::error::AppError;
use crpy::reference::DOCKER_HUB;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(err) = run(cli) {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env("CRPY_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,crpy={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<(), AppError> {
    let proxy = cli.proxy;

    match cli.command {
        Commands::Pull(args) => {
            execute_pull(PullOptions {
                image: args.image,
                output: args.output,
                platform: args.platform,
                proxy,
            })?;
        }
        Commands::Push(args) => {
            execute_push(PushOptions { input: args.input, image: args.image, proxy })?;
        }
        Commands::Login(args) => {
            execute_login(LoginOptions {
                registry: args.registry,
                username: args.username,
                password: args.password,
                proxy,
            })?;
        }
        Commands::Logout(args) => {
            execute_logout(LogoutOptions { registry: args.registry })?;
        }
        Commands::Manifest(args) => {
            let options =
                InspectOptions { image: args.image.image, platform: args.image.platform, proxy };
            execute_manifest(options, args.list)?;
        }
        Commands::Inspect(args) => {
            execute_inspect(InspectOptions { image: args.image, platform: args.platform, proxy })?;
        }
        Commands::Layers(args) => {
            execute_layers(InspectOptions { image: args.image, platform: args.platform, proxy })?;
        }
        Commands::Cache(args) => {
            execute_cache(CacheOptions { show_path: args.path, clear: args.clear })?;
        }
        Commands::Settings(args) => {
            execute_settings(SettingsOptions { show_path: args.path, edit: args.edit })?;
        }
    }

    Ok(())
}

#[derive(Parser)]
#[command(
    name = "crpy",
    version,
    about = "Pull and push container images without installing the docker virtual machine.",
    arg_required_else_help = true
)]
struct Cli {
    /// Proxy for all registry requests.
    #[arg(long, global = true, value_name = "URL")]
    proxy: Option<String>,

    /// Log more details to stderr (repeat for debug output).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull an image from a remote registry into a tarball.
    Pull(PullArgs),
    /// Push an image tarball to a remote registry.
    Push(PushArgs),
    /// Log in to a remote registry.
    Login(LoginArgs),
    /// Forget the stored credentials of a registry.
    Logout(LogoutArgs),
    /// Print the manifest of a remote image.
    Manifest(ManifestArgs),
    /// Print the configuration of a remote image.
    Inspect(ImageArgs),
    /// List the layers of a remote image.
    Layers(ImageArgs),
    /// Show or clear the local layer cache.
    Cache(CacheArgs),
    /// Manage crpy settings (proxy, cache location, default platform).
    #[command(alias = "cfg")]
    Settings(SettingsArgs),
}

#[derive(Args)]
struct PullArgs {
    /// Remote image to pull from, e.g. alpine:3.18 or gcr.io/distroless/cc.
    #[arg(value_name = "IMAGE")]
    image: String,

    /// Output file for the image tarball.
    #[arg(value_name = "FILE")]
    output: PathBuf,

    /// Platform to pull from a multi-platform image, e.g. linux/arm64/v8.
    #[arg(long, value_name = "OS/ARCH[/VARIANT]")]
    platform: Option<String>,
}

#[derive(Args)]
struct PushArgs {
    /// Tarball containing the image, as written by `docker save` or `crpy pull`.
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Remote image to push to.
    #[arg(value_name = "IMAGE")]
    image: String,
}

#[derive(Args)]
struct LoginArgs {
    /// Registry to log in to.
    #[arg(value_name = "REGISTRY", default_value = DOCKER_HUB)]
    registry: String,

    /// Username (prompted when omitted).
    #[arg(short, long)]
    username: Option<String>,

    /// Password (prompted when omitted).
    #[arg(short, long)]
    password: Option<String>,
}

#[derive(Args)]
struct LogoutArgs {
    /// Registry to log out from.
    #[arg(value_name = "REGISTRY", default_value = DOCKER_HUB)]
    registry: String,
}

#[derive(Args)]
struct ImageArgs {
    /// Remote image.
    #[arg(value_name = "IMAGE")]
    image: String,

    /// Platform to select from a multi-platform image.
    #[arg(long, value_name = "OS/ARCH[/VARIANT]")]
    platform: Option<String>,
}

#[derive(Args)]
struct ManifestArgs {
    #[command(flatten)]
    image: ImageArgs,

    /// Print the manifest list instead of a single manifest.
    #[arg(long, action = ArgAction::SetTrue, conflicts_with = "platform")]
    list: bool,
}

#[derive(Args)]
struct CacheArgs {
    /// Only print the cache directory.
    #[arg(long = "path", action = ArgAction::SetTrue, conflicts_with = "clear")]
    path: bool,

    /// Delete every cached layer.
    #[arg(long = "clear", action = ArgAction::SetTrue)]
    clear: bool,
}

#[derive(Args)]
struct SettingsArgs {
    /// Show the settings file path.
    #[arg(long = "path", action = ArgAction::SetTrue)]
    path: bool,

    /// Open the settings file in $EDITOR.
    #[arg(long = "edit", action = ArgAction::SetTrue)]
    edit: bool,
}
