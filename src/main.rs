use anyhow::{bail, Context, Result};
use audiobook_maker::analysis::{analyze, Analysis};
use audiobook_maker::artifacts::book_file_stem;
use audiobook_maker::audio::ResilientAssembler;
use audiobook_maker::export::{write_chapter_files, write_single_file};
use audiobook_maker::provider::{CachedProvider, EspeakProvider, SpeechProvider, VoiceCatalog};
use audiobook_maker::{
    AudioFormat, BookInfo, Config, GenerateRequest, JobOutcome, OutputMode, SynthesisEngine,
    SynthesisJob,
};
use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

fn input_arg() -> Arg {
    Arg::new("input")
        .short('i')
        .long("input")
        .value_name("FILE")
        .help("Input EPUB or .txt file")
        .required(true)
}

fn build_cli() -> Command {
    Command::new("Audiobook Maker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Turns EPUB and plain-text books into narrated audiobooks")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON settings file")
                .global(true),
        )
        .arg(
            Arg::new("log")
                .long("log")
                .value_name("FILTER")
                .help("Log filter, e.g. debug or audiobook_maker=trace (default: RUST_LOG or info)")
                .global(true),
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .value_name("NUM")
                .help("Number of worker threads for document analysis")
                .value_parser(clap::value_parser!(usize))
                .global(true),
        )
        .subcommand(
            Command::new("info")
                .about("Show the chapters found in a book")
                .arg(input_arg()),
        )
        .subcommand(
            Command::new("export")
                .about("Write the cleaned chapter text")
                .arg(input_arg())
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("PATH")
                        .help("Output .txt file, or directory with --split")
                        .required(true),
                )
                .arg(
                    Arg::new("split")
                        .long("split")
                        .help("One numbered file per chapter plus _manifest.json")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("generate")
                .about("Synthesize the audiobook")
                .arg(input_arg())
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("DIR")
                        .help("Output directory")
                        .required(true),
                )
                .arg(
                    Arg::new("format")
                        .short('f')
                        .long("format")
                        .value_name("FORMAT")
                        .help("Output audio format")
                        .value_parser(["wav", "mp3"]),
                )
                .arg(
                    Arg::new("voice")
                        .short('v')
                        .long("voice")
                        .value_name("VOICE")
                        .help("Voice identifier (see the voices command)"),
                )
                .arg(
                    Arg::new("rate")
                        .short('r')
                        .long("rate")
                        .value_name("RATE")
                        .help("Speaking rate modifier, e.g. +10% or -5%")
                        .allow_hyphen_values(true),
                )
                .arg(
                    Arg::new("mode")
                        .short('m')
                        .long("mode")
                        .value_name("MODE")
                        .help("One file for the book or one per chapter")
                        .value_parser(["single", "chapters"])
                        .default_value("single"),
                )
                .arg(
                    Arg::new("chapters")
                        .long("chapters")
                        .value_name("LIST")
                        .help("Chapters to render in chapter mode, e.g. 1,3,5-8"),
                )
                .arg(
                    Arg::new("chunk-size")
                        .long("chunk-size")
                        .value_name("CHARS")
                        .help("Maximum characters per synthesis request")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("cache")
                        .long("cache")
                        .help("Reuse synthesized audio from the cache directory")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(Command::new("voices").about("List the installed voices"))
}

fn init_logging(matches: &ArgMatches) {
    let filter = match matches.get_one::<String>("log") {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(matches: &ArgMatches) -> Result<Config> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::load(Path::new(path))
            .with_context(|| format!("Failed to load settings from {}", path))?,
        None => Config::default(),
    };
    if let Some(workers) = matches.get_one::<usize>("workers") {
        config.workers = *workers;
    }
    Ok(config)
}

/// `"1,3,5-8"` to `[1, 3, 5, 6, 7, 8]`.
fn parse_chapter_list(list: &str) -> Result<Vec<usize>> {
    let mut indices = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: usize = start.trim().parse().with_context(|| format!("Bad chapter range '{}'", part))?;
                let end: usize = end.trim().parse().with_context(|| format!("Bad chapter range '{}'", part))?;
                if start > end {
                    bail!("Bad chapter range '{}'", part);
                }
                indices.extend(start..=end);
            }
            None => indices.push(part.parse().with_context(|| format!("Bad chapter number '{}'", part))?),
        }
    }
    if indices.is_empty() {
        bail!("No chapters given");
    }
    Ok(indices)
}

async fn analyze_input(matches: &ArgMatches, config: &Config) -> Result<Analysis> {
    let input = PathBuf::from(matches.get_one::<String>("input").context("missing input")?);
    let config = config.clone();
    let path = input.clone();
    tokio::task::spawn_blocking(move || analyze(&path, &config))
        .await?
        .with_context(|| format!("Failed to read {}", input.display()))
}

fn print_book_info(book: &BookInfo) {
    println!("\n{}", "═".repeat(60));
    println!("  {}", book.title);
    println!("  by {}", book.author);
    println!("{}", "═".repeat(60));
    if !book.language.is_empty() {
        println!("  Language:   {}", book.language);
    }
    if !book.publisher.is_empty() {
        println!("  Publisher:  {}", book.publisher);
    }
    println!("  Chapters:   {}", book.chapters.len());
    println!("  Words:      {}", book.total_words);
    println!("  Characters: {}", book.total_chars);
    println!("  Duration ~  {:.0} minutes", book.estimated_duration_minutes);
    println!("{}", "─".repeat(60));
    for chapter in &book.chapters {
        let title: String = chapter.title.chars().take(45).collect();
        println!(
            "  {:3}. {:<45} {:>6} words  ~{:.0} min",
            chapter.index,
            title,
            chapter.word_count,
            chapter.estimated_minutes()
        );
    }
    println!("{}\n", "═".repeat(60));
}

async fn run_info(matches: &ArgMatches, config: &Config) -> Result<()> {
    println!("📖 Analyzing book...");
    let analysis = analyze_input(matches, config).await?;
    print_book_info(&analysis.book);
    if !analysis.preview.is_empty() {
        println!("🔎 Preview: {}", analysis.preview);
    }
    Ok(())
}

async fn run_export(matches: &ArgMatches, config: &Config) -> Result<()> {
    let output = PathBuf::from(matches.get_one::<String>("output").context("missing output")?);
    println!("📖 Analyzing book...");
    let analysis = analyze_input(matches, config).await?;
    println!("✅ Found {} chapters", analysis.book.chapters.len());

    if matches.get_flag("split") {
        let manifest = write_chapter_files(&analysis.book, &output)?;
        println!("📁 Chapter files written, manifest: {}", manifest.display());
    } else {
        write_single_file(&analysis.book, &output)?;
        println!("📁 Text saved to: {}", output.display());
    }
    Ok(())
}

fn build_provider(config: &Config) -> Result<Arc<dyn SpeechProvider>> {
    let provider: Arc<dyn SpeechProvider> = Arc::new(EspeakProvider::detect(config.audio_format)?);
    if config.cache_enabled {
        let cached = CachedProvider::new(provider, &config.cache_dir)
            .with_context(|| format!("Cannot use cache directory {}", config.cache_dir.display()))?;
        return Ok(Arc::new(cached));
    }
    Ok(provider)
}

async fn run_generate(matches: &ArgMatches, mut config: Config) -> Result<()> {
    if let Some(format) = matches.get_one::<String>("format") {
        config.audio_format = match format.as_str() {
            "mp3" => AudioFormat::Mp3,
            _ => AudioFormat::Wav,
        };
    }
    if let Some(voice) = matches.get_one::<String>("voice") {
        config.voice = voice.clone();
    }
    if let Some(rate) = matches.get_one::<String>("rate") {
        config.rate = rate.clone();
    }
    if let Some(chunk_size) = matches.get_one::<usize>("chunk-size") {
        config.chunk_max_chars = *chunk_size;
    }
    if matches.get_flag("cache") {
        config.cache_enabled = true;
    }
    config.validate()?;

    let mode = match matches.get_one::<String>("mode").map(String::as_str) {
        Some("chapters") => OutputMode::PerChapter,
        _ => OutputMode::SingleFile,
    };
    let chapters = matches
        .get_one::<String>("chapters")
        .map(|list| parse_chapter_list(list))
        .transpose()?;
    if chapters.is_some() && mode == OutputMode::SingleFile {
        println!("⚠️  --chapters only applies to chapter mode, rendering the whole book");
    }
    let output_dir = PathBuf::from(matches.get_one::<String>("output").context("missing output")?);

    println!("🔄 Initializing audiobook generation...");
    let start_time = Instant::now();

    println!("📖 Analyzing book...");
    let analysis = analyze_input(matches, &config).await?;
    println!(
        "✅ Found {} chapters, {} words",
        analysis.book.chapters.len(),
        analysis.book.total_words
    );

    let provider = build_provider(&config)?;
    let assembler = Arc::new(ResilientAssembler::new(config.audio_format, config.sample_rate));
    let engine = Arc::new(SynthesisEngine::new(provider, assembler, &config));

    let job = Arc::new(SynthesisJob::new(
        book_file_stem(&analysis.book.title),
        analysis.book,
    ));
    let mut request = GenerateRequest::new(&config, mode, &output_dir);
    request.chapters = chapters;

    println!("🎤 Synthesizing speech...");
    let mut handle = engine.start(Arc::clone(&job), request);

    let progress_bar = ProgressBar::new(0);
    progress_bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>7}/{len:7} {msg}")?
            .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    let mut ticker = tokio::time::interval(Duration::from_millis(250));

    let outcome = loop {
        tokio::select! {
            result = &mut handle => break result.context("Synthesis task failed")?,
            _ = tokio::signal::ctrl_c() => {
                job.cancel(true);
                progress_bar.set_message("Cancelling...");
            }
            _ = ticker.tick() => {
                let snapshot = job.poll();
                progress_bar.set_length(snapshot.total_chunks as u64);
                progress_bar.set_position(snapshot.current_chunk as u64);
                progress_bar.set_message(snapshot.message);
            }
        }
    };
    progress_bar.finish_and_clear();

    match outcome {
        JobOutcome::Done {
            artifacts,
            failed_chunks,
            ..
        } => {
            if failed_chunks > 0 {
                println!("⚠️  {} chunks could not be synthesized and were replaced by silence", failed_chunks);
            }
            println!("✅ Generation completed in {:.2?}", start_time.elapsed());
            for artifact in artifacts {
                println!("📁 {}", artifact.display());
            }
            Ok(())
        }
        JobOutcome::Cancelled(reason) => {
            println!("🛑 Generation cancelled ({:?})", reason);
            Ok(())
        }
        JobOutcome::Failed(message) => bail!("Generation failed: {}", message),
    }
}

async fn run_voices(config: &Config) -> Result<()> {
    let provider: Arc<dyn SpeechProvider> = Arc::new(EspeakProvider::detect(config.audio_format)?);
    let catalog = VoiceCatalog::new(provider);
    let groups = catalog.voices().await?;
    for group in groups.iter() {
        println!("🌐 {}", group.language);
        for voice in &group.voices {
            println!("    {:<20} {:<30} {}", voice.id, voice.name, voice.gender);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    init_logging(&matches);
    let config = load_config(&matches)?;

    // Configure Rayon thread pool
    rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .build_global()?;

    match matches.subcommand() {
        Some(("info", sub)) => run_info(sub, &config).await,
        Some(("export", sub)) => run_export(sub, &config).await,
        Some(("generate", sub)) => run_generate(sub, config).await,
        Some(("voices", _)) => run_voices(&config).await,
        _ => bail!("Unknown command"),
    }
}
