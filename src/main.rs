mod cli;

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use tankobon::aggregator::sort_chapters;
use tankobon::config::Config;
use tankobon::pipeline::{Page, PageState, PrefetchPipeline};
use tankobon::Tankobon;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tankobon=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.plugins {
        config.plugins_dir = Some(dir);
    }
    let app = Tankobon::open(config).await?;

    match cli.command {
        Commands::Sources { filters } => {
            app.registry().ready().await;
            for source in app.registry().sources() {
                println!("{}\tdownloadable={}\t{}", source.id(), source.downloadable(), source.icon());
                if filters {
                    let tree = app.registry().default_filters(source.id()).unwrap_or_default();
                    println!("{}", serde_json::to_string_pretty(&tree)?);
                }
            }
            for (dir, reason) in app.registry().failures() {
                eprintln!("failed: {} ({reason})", dir.display());
            }
        }
        Commands::Search { source, query, offset } => {
            let page = app.search(&source, &query, offset, None).await?;
            for manga in &page.data {
                println!("{}\t{}", manga.id, manga.name);
            }
            match page.total {
                Some(total) => println!("{} of {total}", page.data.len()),
                None => println!("{} results", page.data.len()),
            }
            if page.has_more(offset) {
                println!("more: --offset {}", offset + page.data.len());
            }
        }
        Commands::Manga { source, id, save } => {
            let mut manga = app.manga(&source, &id).await?;
            if save {
                manga = app.add_to_library(&manga).await?;
                info!(source = %source, id = %id, "added to library");
            }
            println!("{}", serde_json::to_string_pretty(&manga)?);
        }
        Commands::Chapters { source, manga, all_languages } => {
            let mut policy = app.config().catalog.clone();
            if all_languages {
                policy.language = None;
            }
            let mut catalog = app.chapters_with(&source, &manga, &policy).await?;
            sort_chapters(&mut catalog.chapters);
            for chapter in &catalog.chapters {
                let volume = chapter.volume.map(|v| format!("v{v} ")).unwrap_or_default();
                let title = chapter.title.as_deref().unwrap_or("");
                println!("{}\t{volume}c{}\t{}\t{title}", chapter.id, chapter.chapter, chapter.lang.as_deref().unwrap_or("-"));
            }
            println!("{} chapters in {} rounds ({:?})", catalog.chapters.len(), catalog.rounds, catalog.outcome);
        }
        Commands::Download { source, manga, chapter, out, cbz } => {
            let pipeline = app.open_chapter(&source, &manga, &chapter).await?;
            let pages = read_through(&pipeline).await?;
            if cbz {
                let path = write_cbz(&out, &chapter, &pages)?;
                println!("{}", path.display());
            } else {
                write_pages(&out, &pages).await?;
                println!("{} pages in {}", pages.len(), out.display());
            }
        }
        Commands::Library { source, remove: Some(id) } => {
            if !app.remove_from_library(&source, &id).await? {
                bail!("{id} is not in the library of {source}");
            }
            info!(source = %source, id = %id, "removed from library");
        }
        Commands::Library { source, remove: None } => {
            for manga in app.library().get_all_manga(&source).await? {
                println!("{}\t{}", manga.id, manga.name);
            }
        }
    }
    Ok(())
}

/// Step through the chapter like a reader would, retrying each failed page once.
async fn read_through(pipeline: &PrefetchPipeline) -> Result<Vec<Page>> {
    let count = pipeline.pages().len();
    let mut done = Vec::with_capacity(count);
    let mut failed = 0usize;
    for index in 0..count {
        let mut page = settled_current(pipeline, index).await?;
        if page.state == PageState::Errored {
            warn!(url = %page.url, "retrying page");
            pipeline.retry(&page.url);
            page = settled_current(pipeline, index).await?;
        }
        if page.state == PageState::Completed {
            done.push(page);
        } else {
            failed += 1;
            eprintln!("page {} failed: {}", index + 1, page.error.map(|e| e.to_string()).unwrap_or_default());
        }
    }
    if failed > 0 {
        bail!("{failed} of {count} pages failed");
    }
    Ok(done)
}

async fn settled_current(pipeline: &PrefetchPipeline, index: usize) -> Result<Page> {
    let mut rx = pipeline.watch_current();
    pipeline.set_current(index);
    loop {
        // mark seen before reading the live state so a completion in between still wakes us
        rx.borrow_and_update();
        if pipeline.current_index() != Some(index) {
            bail!("page {} is not part of the chapter", index + 1);
        }
        if let Some(page) = pipeline.current() {
            if matches!(page.state, PageState::Completed | PageState::Errored) {
                return Ok(page);
            }
        }
        rx.changed().await.context("pipeline closed")?;
    }
}

fn extension(page: &Page) -> &'static str {
    let content_type = page.data.as_ref().and_then(|d| d.content_type.as_deref()).unwrap_or("");
    match content_type.split(';').next().map(str::trim) {
        Some("image/jpeg") | Some("image/jpg") => "jpg",
        Some("image/png") => "png",
        Some("image/webp") => "webp",
        Some("image/gif") => "gif",
        Some("image/avif") => "avif",
        _ => "bin",
    }
}

async fn write_pages(out: &Path, pages: &[Page]) -> Result<()> {
    tokio::fs::create_dir_all(out)
        .await
        .with_context(|| format!("creating {}", out.display()))?;
    for (i, page) in pages.iter().enumerate() {
        let path = out.join(format!("{:03}.{}", i + 1, extension(page)));
        tokio::fs::write(&path, page.bytes().unwrap_or_default())
            .await
            .with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

fn write_cbz(out: &Path, chapter: &str, pages: &[Page]) -> Result<PathBuf> {
    std::fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;
    let path = out.join(format!("{chapter}.cbz"));
    let file = std::fs::File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    let mut zip = zip::ZipWriter::new(file);
    // images are already compressed
    let options = zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (i, page) in pages.iter().enumerate() {
        zip.start_file(format!("{:03}.{}", i + 1, extension(page)), options)?;
        zip.write_all(page.bytes().unwrap_or_default())?;
    }
    zip.finish()?;
    Ok(path)
}
