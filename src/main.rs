use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use inquire::error::InquireResult;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gazovec::config::Config;
use gazovec::engine::EngineContext;
use gazovec::listing::ImageLister;
use gazovec::vectors::{
    cosine_similarity, file_fingerprint, find_similar, interpret, move_files, BatchVectorizer,
    EmbeddingCache, FeatureEmbedder, ImageEmbedder, SimilarOptions, SimilarityPlaylist,
    VectorStore,
};

mod cli;

const DEFAULT_DATA_DIR: &str = "data";

fn setup_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

fn pb_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

fn load_model(config: &Config) -> anyhow::Result<Arc<dyn FeatureEmbedder>> {
    let model = ImageEmbedder::new(
        &config.vectors.model,
        &config.data_dir(),
        config.vectors.embed_batch_size,
    )
    .with_context(|| format!("cannot load model '{}'", config.vectors.model))?;

    Ok(Arc::new(model))
}

fn open_engine(
    config: &Config,
    embedder: Option<Arc<dyn FeatureEmbedder>>,
) -> anyhow::Result<Arc<EngineContext>> {
    let store = VectorStore::new(config.store_path(), config.vectors.model.clone());
    let cache = EmbeddingCache::new(config.cache.max_entries);
    let ctx = EngineContext::open(store, cache, embedder)
        .with_context(|| format!("cannot open vector file {}", config.store_path().display()))?;

    Ok(Arc::new(ctx))
}

/// Cancel flag raised by Ctrl-C.
fn ctrlc_flag() -> anyhow::Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    ctrlc::set_handler(move || {
        log::warn!("interrupted, stopping after the current file");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("cannot install Ctrl-C handler")?;

    Ok(flag)
}

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    setup_logging(args.verbose);

    let config_path = args
        .config
        .unwrap_or_else(|| Path::new(DEFAULT_DATA_DIR).join(gazovec::config::CONFIG_FILE));
    let config = Config::load_from(&config_path)
        .with_context(|| format!("cannot load config {}", config_path.display()))?;
    let lister = ImageLister::new(&config.listing.extensions);

    match args.command {
        #[cfg(feature = "markdown-docs")]
        cli::Command::MarkdownDocs {} => {
            clap_markdown::print_help_markdown::<cli::Args>();
            Ok(())
        }

        cli::Command::Vectorize {
            folder,
            recursive,
            timeout,
        } => {
            let recursive = recursive || config.listing.include_subfolders;
            let files = lister.collect_images(&folder, recursive);
            if files.is_empty() {
                println!("No images in {}", folder.display());
                return Ok(());
            }

            // a missing model is reported by the job itself
            let embedder = load_model(&config)
                .map_err(|e| log::error!("{e:#}"))
                .ok();
            let ctx = open_engine(&config, embedder)?;

            let mut options = config.batch_options();
            if let Some(secs) = timeout {
                options.timeout = Duration::from_secs(secs);
            }

            let pb = ProgressBar::new(files.len() as u64).with_style(pb_style());
            let progress_pb = pb.clone();

            let vectorizer = BatchVectorizer::new(ctx);
            let job = vectorizer.start(
                files,
                options,
                move |progress| {
                    progress_pb.set_position(progress.current as u64);
                    progress_pb.set_message(progress.file_name);
                },
                |_| {},
            )?;

            let cancel = job.cancel_flag();
            ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst))
                .context("cannot install Ctrl-C handler")?;

            let report = job.join();
            pb.finish_and_clear();

            println!("{}", report.summary());
            Ok(())
        }

        cli::Command::Similar {
            image,
            folder,
            threshold,
            move_to,
            yes,
            cached_only,
        } => {
            let target = image
                .canonicalize()
                .with_context(|| format!("cannot open {}", image.display()))?;
            let folder = folder
                .or_else(|| target.parent().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from("."));
            let threshold = threshold.unwrap_or(if move_to.is_some() {
                config.similarity.smart_move_threshold
            } else {
                config.similarity.threshold
            });

            let files: Vec<PathBuf> = lister
                .collect_images(&folder, config.listing.include_subfolders)
                .into_iter()
                .filter_map(|p| p.canonicalize().ok())
                .collect();

            let ctx = open_engine(&config, Some(load_model(&config)?))?;
            let options = SimilarOptions {
                compute_missing: !cached_only,
                cancel: Some(ctrlc_flag()?),
            };

            let results = find_similar(&ctx, &target, &files, threshold, &options)?;
            if results.is_empty() {
                println!("No images above {threshold}");
                return Ok(());
            }

            for result in &results {
                println!("{:.3}  {}", result.score, result.path.display());
            }

            let Some(dest) = move_to else {
                return Ok(());
            };

            if !yes {
                match inquire::prompt_confirmation(format!(
                    "Move {} images to {}?",
                    results.len(),
                    dest.display()
                )) {
                    InquireResult::Ok(true) => {}
                    InquireResult::Ok(false) => return Ok(()),
                    InquireResult::Err(err) => bail!("An error occurred: {}", err),
                }
            }

            let paths: Vec<PathBuf> = results.into_iter().map(|r| r.path).collect();
            let report = move_files(&paths, &dest);
            for (path, reason) in &report.skipped {
                println!("skipped {}: {reason}", path.display());
            }
            println!("{} images moved", report.moved.len());
            Ok(())
        }

        cli::Command::Playlist {
            folder,
            threshold,
            count,
            random,
        } => {
            let threshold = threshold.unwrap_or(config.similarity.threshold);
            let files = lister.collect_images(&folder, config.listing.include_subfolders);
            let count = count.unwrap_or(files.len());

            // seeds without a vector are still shown, just not chained
            let embedder = load_model(&config)
                .map_err(|e| log::warn!("{e:#}"))
                .ok();
            let ctx = open_engine(&config, embedder)?;

            let mut playlist = SimilarityPlaylist::new(ctx, config.traversal_options());
            playlist.set_files(files);

            for index in 1..=count {
                let next = if random {
                    playlist.random_image()
                } else {
                    playlist.next_image(threshold)
                };
                let Some(next) = next else {
                    println!("No images in {}", folder.display());
                    break;
                };
                println!("{index:>4}  {}", next.display());
            }
            Ok(())
        }

        cli::Command::Compare { a, b } => {
            let ctx = open_engine(&config, Some(load_model(&config)?))?;
            let va = ctx.embedding(&a)?;
            let vb = ctx.embedding(&b)?;
            ctx.persist()?;

            println!("{:.4}", cosine_similarity(&va, &vb)?);
            Ok(())
        }

        cli::Command::Hash { files } => {
            let mut failed = 0;
            for file in &files {
                match file_fingerprint(file) {
                    Ok(fp) => println!("{fp}  {}", file.display()),
                    Err(e) => {
                        log::error!("{e}");
                        failed += 1;
                    }
                }
            }

            if failed > 0 {
                bail!("{failed} files could not be read");
            }
            Ok(())
        }

        cli::Command::Inspect {
            image,
            mode,
            top,
            min_score,
        } => {
            let ctx = open_engine(&config, Some(load_model(&config)?))?;
            let vector = ctx.embedding(&image)?;
            ctx.persist()?;

            println!("{} dimensions, {mode} scores", vector.len());
            for dim in interpret(&vector, mode, min_score, top) {
                println!("{:>6}  {:>9.5}  {:.5}", dim.dimension, dim.value, dim.score);
            }
            Ok(())
        }

        cli::Command::Stats {} => {
            let ctx = open_engine(&config, None)?;
            let cache = ctx.cache_stats();

            println!("config:      {}", config.path().display());
            println!("vector file: {}", ctx.store().path().display());
            println!("model:       {}", ctx.store().model_id());
            println!("vectors:     {}", ctx.vector_count());
            println!("cache size:  {}", cache.max_entries);
            println!("threshold:   {}", config.similarity.threshold);
            Ok(())
        }
    }
}
