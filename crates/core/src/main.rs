// Trawler is a decentralized web crawling and archiving cluster.
// Copyright (C) 2024 Stract ApS
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use tracing_subscriber::prelude::*;

use trawler::config;
use trawler::job::ingest::JobDefinition;
use trawler::job::ingest::write_job_file;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a stager. Stagers own the replicated job state, place urls on
    /// crawlers and receive finished WARC files.
    Stager {
        #[clap(long)]
        host: Option<String>,

        #[clap(long)]
        port: Option<u16>,

        /// Existing stager to join for cluster bootstrap.
        #[clap(long)]
        stager_host: Option<String>,

        #[clap(long)]
        stager_port: Option<u16>,

        #[clap(long)]
        config: Option<PathBuf>,
    },

    /// Deploy a crawler. Crawlers attach to stagers, fetch the urls they are
    /// assigned and upload the resulting WARC files.
    Crawler {
        #[clap(long)]
        host: Option<String>,

        #[clap(long)]
        port: Option<u16>,

        /// Stager to attach to. Required; a crawler cannot join on its own.
        #[clap(long)]
        stager_host: Option<String>,

        #[clap(long)]
        stager_port: Option<u16>,

        #[clap(long)]
        config: Option<PathBuf>,
    },

    /// Resolve a job definition file and drop it into the new-jobs
    /// directory, where the stager's ingest loop picks it up.
    AddJob {
        definition: PathBuf,

        #[clap(long, default_value = "jobs")]
        jobs_dir: PathBuf,
    },
}

fn load_toml_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let raw_config = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: '{}'", path.display()))?;
    toml::from_str(&raw_config)
        .with_context(|| format!("Failed to parse config: '{}'", path.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive("trawler=info".parse().unwrap())
                .from_env_lossy(),
        )
        .without_time()
        .with_target(false)
        .finish()
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Stager {
            host,
            port,
            stager_host,
            stager_port,
            config,
        } => {
            let mut config: config::StagerConfig = match config {
                Some(path) => load_toml_config(path)?,
                None => config::StagerConfig::default(),
            };
            config.host = host.or(config.host);
            config.port = port.or(config.port);
            config.stager_host = stager_host.or(config.stager_host);
            config.stager_port = stager_port.or(config.stager_port);

            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(trawler::stager::run(config))?;
        }
        Commands::Crawler {
            host,
            port,
            stager_host,
            stager_port,
            config,
        } => {
            let mut config: config::CrawlerConfig = match config {
                Some(path) => load_toml_config(path)?,
                None => config::CrawlerConfig::default(),
            };
            config.host = host.or(config.host);
            config.port = port.or(config.port);
            config.stager_host = stager_host.or(config.stager_host);
            config.stager_port = stager_port.or(config.stager_port);

            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(trawler::crawler::run(config))?;
        }
        Commands::AddJob {
            definition,
            jobs_dir,
        } => {
            let raw = std::fs::read_to_string(&definition).with_context(|| {
                format!("Failed to read job definition: '{}'", definition.display())
            })?;
            let settings = JobDefinition::parse(&raw)?.into_settings(&definition)?;

            println!("Found {} urls.", settings.urls.len());
            let path = write_job_file(&settings, &jobs_dir)?;
            println!("Created job file in {}.", path.display());
        }
    }

    Ok(())
}
