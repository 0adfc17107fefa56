use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Debugging and development CLI for tankobon providers
#[derive(Parser)]
#[command(name = "tankobon")]
#[command(about = "Browse and download manga through WebAssembly providers", long_about = None)]
pub struct Cli {
    /// Config file to use instead of the one in the user config directory
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Provider root, overriding the config file
    #[arg(long, global = true)]
    pub plugins: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List loaded sources
    Sources {
        /// Also print each source's default filter tree
        #[arg(long)]
        filters: bool,
    },
    /// Search a source
    Search {
        source: String,
        query: String,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Show manga details
    Manga {
        source: String,
        id: String,
        /// Add the manga to the library
        #[arg(long)]
        save: bool,
    },
    /// Aggregate the full chapter list of a manga
    Chapters {
        source: String,
        manga: String,
        /// Keep chapters in every language
        #[arg(long)]
        all_languages: bool,
    },
    /// Download every page of a chapter
    Download {
        source: String,
        manga: String,
        chapter: String,
        #[arg(short, long)]
        out: PathBuf,
        /// Write a .cbz archive instead of loose image files
        #[arg(long)]
        cbz: bool,
    },
    /// List library manga of a source
    Library {
        source: String,
        /// Remove this manga and its stored chapters instead of listing
        #[arg(long)]
        remove: Option<String>,
    },
}
