use std::fs::File;
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use docker_charon::config::CharonConfig;
use docker_charon::planner::parse_image_list;
use docker_charon::{decoder, encoder};
use miette::{IntoDiagnostic, Result, miette};
use ociclient::Client;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Move docker images to a registry without network access between the two
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pull images from a registry and package them into a payload
    MakePayload {
        /// Comma separated images to put in the payload, e.g. "ubuntu:bionic,redis:7"
        images: String,

        /// Comma separated images the destination registry already has
        #[arg(long, default_value = "")]
        already_transferred: String,

        /// Write the payload to this file instead of stdout
        #[arg(short, long)]
        file: Option<PathBuf>,

        #[command(flatten)]
        registry: RegistryArgs,
    },
    /// Push the images of a payload to a registry
    PushPayload {
        /// Read the payload from this file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Fail when an image expected at the destination is missing
        #[arg(long)]
        strict: bool,

        #[command(flatten)]
        registry: RegistryArgs,
    },
}

#[derive(Debug, Args)]
struct RegistryArgs {
    /// Registry host, e.g. "localhost:5000"
    #[arg(long)]
    registry: Option<String>,

    /// Use plain http to talk to the registry
    #[arg(long)]
    insecure: bool,

    /// Can also be set with DOCKER_CHARON_USERNAME
    #[arg(long)]
    username: Option<String>,

    /// Can also be set with DOCKER_CHARON_PASSWORD
    #[arg(long)]
    password: Option<String>,

    /// Additional configuration file
    #[arg(short = 'c', long = "config")]
    config_file: Option<PathBuf>,
}

impl RegistryArgs {
    async fn connect(self) -> Result<Client> {
        let mut config = CharonConfig::load(self.config_file.as_deref()).into_diagnostic()?;
        if self.registry.is_some() {
            config.registry = self.registry;
        }
        if self.username.is_some() {
            config.username = self.username;
        }
        if self.password.is_some() {
            config.password = self.password;
        }
        config.insecure |= self.insecure;

        let mut client = Client::new(config.registry().into_diagnostic()?, config.insecure)
            .with_upload_chunk_size(config.upload_chunk_size);
        if let Some((username, password)) = config.credentials() {
            client
                .authenticate(username, password)
                .await
                .into_diagnostic()?;
        } else if !client.check_api().await.into_diagnostic()? {
            return Err(miette!(
                "{} does not serve the registry API",
                client.registry_url()
            ));
        }
        debug!(registry = client.registry_url(), "Connected");
        Ok(client)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    // stdout carries payloads and image lists
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::MakePayload {
            images,
            already_transferred,
            file,
            registry,
        } => {
            let to_transfer = parse_image_list(&images).into_diagnostic()?;
            let already_transferred = parse_image_list(&already_transferred).into_diagnostic()?;
            let client = registry.connect().await?;
            make_payload(&client, &to_transfer, &already_transferred, file).await
        }
        Command::PushPayload {
            file,
            strict,
            registry,
        } => {
            let client = registry.connect().await?;
            push_payload(&client, file, strict).await
        }
    }
}

async fn make_payload(
    client: &Client,
    to_transfer: &[ociclient::ImageReference],
    already_transferred: &[ociclient::ImageReference],
    file: Option<PathBuf>,
) -> Result<()> {
    match file {
        Some(path) => {
            let out = BufWriter::new(File::create(&path).into_diagnostic()?);
            let mut out =
                encoder::make_payload(client, to_transfer, already_transferred, out)
                    .await
                    .into_diagnostic()?;
            out.flush().into_diagnostic()?;
            info!("Payload written to {}", path.display());
        }
        None => {
            // zip needs to seek back, so the payload is staged before stdout
            let out = BufWriter::new(tempfile::tempfile().into_diagnostic()?);
            let out = encoder::make_payload(client, to_transfer, already_transferred, out)
                .await
                .into_diagnostic()?;
            let mut staged = out.into_inner().map_err(|e| e.into_error()).into_diagnostic()?;
            staged.seek(SeekFrom::Start(0)).into_diagnostic()?;
            let mut stdout = io::stdout().lock();
            io::copy(&mut staged, &mut stdout).into_diagnostic()?;
            stdout.flush().into_diagnostic()?;
        }
    }
    Ok(())
}

async fn push_payload(client: &Client, file: Option<PathBuf>, strict: bool) -> Result<()> {
    let input = match file {
        Some(path) => File::open(path).into_diagnostic()?,
        None => {
            let mut staged = tempfile::tempfile().into_diagnostic()?;
            io::copy(&mut io::stdin().lock(), &mut staged).into_diagnostic()?;
            staged.seek(SeekFrom::Start(0)).into_diagnostic()?;
            staged
        }
    };

    let replicated = decoder::replicate(client, BufReader::new(input), strict)
        .await
        .into_diagnostic()?;

    eprintln!("List of docker images pushed to the registry:");
    let mut stdout = io::stdout().lock();
    for reference in replicated {
        writeln!(stdout, "{reference}").into_diagnostic()?;
    }
    Ok(())
}
