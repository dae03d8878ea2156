//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use sitekb_core::{
    AnthropicGenerator, ContextBudget, GenerationOptions, HttpEmbedder, ProgressReporter,
    RetrievedRecord, RetryPolicy,
};
use sitekb_shared::{
    AppConfig, Corpus, CrawlConfig, IndexConfig, KnowledgeBase, Query, expand_home, init_config,
    load_config, load_config_from,
};
use sitekb_storage::KbStore;
use tracing::info;
use url::Url;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// SiteKB: turn a website into a queryable knowledge base.
#[derive(Parser)]
#[command(
    name = "sitekb",
    version,
    about = "Scrape a website into a corpus, index it, and ask questions about it.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.sitekb/sitekb.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Crawl flags shared by `scrape` and `add`. Unset flags fall back to the
/// config file.
#[derive(Args, Debug)]
pub(crate) struct CrawlArgs {
    /// Maximum pages accepted by discovery.
    #[arg(long)]
    pub max_pages: Option<usize>,

    /// Concurrent HTTP requests.
    #[arg(long)]
    pub concurrency: Option<u32>,

    /// Maximum link depth from the root URL.
    #[arg(long)]
    pub max_depth: Option<u32>,

    /// Comma-separated regexes; only matching URLs are kept.
    #[arg(long = "include", value_delimiter = ',')]
    pub include_patterns: Vec<String>,

    /// Comma-separated regexes; matching URLs are never fetched.
    #[arg(long = "exclude", value_delimiter = ',')]
    pub exclude_patterns: Vec<String>,

    /// Overall time limit in seconds for each of discovery and extraction.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Pages with less content than this (in chars) are dropped.
    #[arg(long)]
    pub min_content_chars: Option<usize>,

    /// Ignore robots.txt Disallow rules.
    #[arg(long)]
    pub ignore_robots: bool,
}

impl CrawlArgs {
    fn apply(&self, mut config: CrawlConfig) -> CrawlConfig {
        if let Some(n) = self.max_pages {
            config.max_pages = n;
        }
        if let Some(n) = self.concurrency {
            config.concurrency = n.max(1);
        }
        if let Some(n) = self.max_depth {
            config.max_depth = n;
        }
        if !self.include_patterns.is_empty() {
            config.include_patterns = self.include_patterns.clone();
        }
        if !self.exclude_patterns.is_empty() {
            config.exclude_patterns = self.exclude_patterns.clone();
        }
        if let Some(n) = self.timeout_secs {
            config.timeout_secs = n;
        }
        if let Some(n) = self.min_content_chars {
            config.min_content_chars = n;
        }
        if self.ignore_robots {
            config.respect_robots_txt = false;
        }
        config
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Discover and extract a site into corpus JSON.
    Scrape {
        /// Root URL or a section URL, e.g. https://example.com/blog
        url: String,

        #[command(flatten)]
        crawl: CrawlArgs,

        /// Output file for the corpus JSON. Prints to stdout if omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Build a knowledge base from a corpus file, replacing its contents.
    Index {
        /// Corpus JSON produced by `scrape`.
        corpus: PathBuf,

        /// Knowledge base directory.
        #[arg(long)]
        kb: Option<PathBuf>,
    },

    /// Append a corpus file's records to a knowledge base.
    Append {
        /// Corpus JSON produced by `scrape`.
        corpus: PathBuf,

        /// Knowledge base directory.
        #[arg(long)]
        kb: Option<PathBuf>,
    },

    /// Scrape a site and append it to a knowledge base in one step.
    Add {
        /// Root URL or a section URL.
        url: String,

        #[command(flatten)]
        crawl: CrawlArgs,

        /// Knowledge base directory.
        #[arg(long)]
        kb: Option<PathBuf>,
    },

    /// Show the records most similar to a query.
    Search {
        query: String,

        /// Number of results.
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Knowledge base directory.
        #[arg(long)]
        kb: Option<PathBuf>,
    },

    /// Answer a question from the knowledge base.
    Ask {
        question: String,

        /// Number of records given to the model.
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Knowledge base directory.
        #[arg(long)]
        kb: Option<PathBuf>,
    },

    /// Show the published generation of a knowledge base.
    Status {
        /// Knowledge base directory.
        #[arg(long)]
        kb: Option<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr so `scrape` can
/// write corpus JSON to stdout.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "sitekb=info",
        1 => "sitekb=debug",
        _ => "sitekb=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    match cli.command {
        Command::Scrape { url, crawl, output } => {
            cmd_scrape(&config, &url, &crawl, output.as_deref()).await
        }
        Command::Index { corpus, kb } => cmd_index(&config, &corpus, kb.as_deref()).await,
        Command::Append { corpus, kb } => cmd_append(&config, &corpus, kb.as_deref()).await,
        Command::Add { url, crawl, kb } => cmd_add(&config, &url, &crawl, kb.as_deref()).await,
        Command::Search { query, top_k, kb } => {
            cmd_search(&config, &query, top_k, kb.as_deref()).await
        }
        Command::Ask {
            question,
            top_k,
            kb,
        } => cmd_ask(&config, &question, top_k, kb.as_deref()).await,
        Command::Status { kb } => cmd_status(&config, kb.as_deref()),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&config),
        },
    }
}

fn parse_root(url: &str) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|e| eyre!("invalid URL '{url}': {e}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(eyre!("only http(s) URLs can be scraped, got '{url}'"));
    }
    Ok(parsed)
}

fn open_store(config: &AppConfig, kb: Option<&Path>) -> Result<KbStore> {
    let dir = match kb {
        Some(p) => p.to_path_buf(),
        None => expand_home(&config.defaults.kb_dir),
    };
    Ok(KbStore::open(&dir)?)
}

fn read_corpus(path: &Path) -> Result<Corpus> {
    let json = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("cannot read corpus file {}", path.display()))?;
    Ok(Corpus::from_json(&json)?)
}

async fn load_published(store: &KbStore) -> Result<KnowledgeBase> {
    match store.load().await? {
        Some(stored) => Ok(stored.kb),
        None => Err(eyre!(
            "knowledge base at {} is empty; run `sitekb add <url>` or `sitekb index <corpus>` first",
            store.root().display()
        )),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_scrape(
    config: &AppConfig,
    url: &str,
    crawl: &CrawlArgs,
    output: Option<&Path>,
) -> Result<()> {
    let root = parse_root(url)?;
    let crawl_config = crawl.apply(CrawlConfig::from(config));
    info!(url, max_pages = crawl_config.max_pages, "scraping site");

    let reporter = CliProgress::new();
    let outcome = sitekb_core::scrape(&root, &crawl_config, &reporter).await;
    reporter.finish();
    let outcome = outcome?;

    let json = outcome.corpus.to_json()?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .wrap_err_with(|| format!("cannot write {}", path.display()))?;
            println!();
            println!("  Saved {} items to {}", outcome.corpus.len(), path.display());
            println!("  Discovered: {}", outcome.crawl.targets.len());
            println!("  Dropped:    {}", outcome.extract.dropped.len());
            println!("  Time:       {:.1}s", outcome.elapsed.as_secs_f64());
            println!();
        }
        None => println!("{json}"),
    }
    Ok(())
}

async fn cmd_index(config: &AppConfig, corpus_path: &Path, kb: Option<&Path>) -> Result<()> {
    let corpus = read_corpus(corpus_path)?;
    let store = open_store(config, kb)?;
    let provider = HttpEmbedder::from_settings(&config.embedding)?;
    info!(items = corpus.len(), kb = %store.root().display(), "building knowledge base");

    let reporter = CliProgress::new();
    reporter.phase("Embedding and indexing");
    let result = sitekb_core::build_and_commit(
        &store,
        &provider,
        &IndexConfig::from(config),
        corpus,
        &reporter,
    )
    .await;
    reporter.finish();
    let manifest = result?;

    println!();
    println!("  Knowledge base built!");
    println!("  Records:    {}", manifest.item_count);
    println!("  Generation: {}", manifest.generation);
    println!("  Path:       {}", store.root().display());
    println!();
    Ok(())
}

async fn cmd_append(config: &AppConfig, corpus_path: &Path, kb: Option<&Path>) -> Result<()> {
    let corpus = read_corpus(corpus_path)?;
    let store = open_store(config, kb)?;
    let provider = HttpEmbedder::from_settings(&config.embedding)?;

    let reporter = CliProgress::new();
    reporter.phase("Embedding and indexing");
    let result = sitekb_core::append_and_commit(
        &store,
        &provider,
        &IndexConfig::from(config),
        &corpus.site,
        corpus.items,
        &reporter,
    )
    .await;
    reporter.finish();
    let manifest = result?;

    println!();
    println!("  Records appended.");
    println!("  Total:      {}", manifest.item_count);
    println!("  Generation: {}", manifest.generation);
    println!();
    Ok(())
}

async fn cmd_add(config: &AppConfig, url: &str, crawl: &CrawlArgs, kb: Option<&Path>) -> Result<()> {
    let root = parse_root(url)?;
    let crawl_config = crawl.apply(CrawlConfig::from(config));
    let store = open_store(config, kb)?;
    let provider = HttpEmbedder::from_settings(&config.embedding)?;
    info!(url, kb = %store.root().display(), "adding site");

    let reporter = CliProgress::new();
    let result = sitekb_core::pipeline::scrape_and_append(
        &root,
        &crawl_config,
        &IndexConfig::from(config),
        &store,
        &provider,
        &reporter,
    )
    .await;
    reporter.finish();
    let (outcome, manifest) = result?;

    println!();
    println!("  Site added!");
    println!("  Extracted:  {}", outcome.corpus.len());
    println!("  Dropped:    {}", outcome.extract.dropped.len());
    println!("  Total:      {}", manifest.item_count);
    println!("  Generation: {}", manifest.generation);
    println!("  Time:       {:.1}s", outcome.elapsed.as_secs_f64());
    println!();
    Ok(())
}

async fn retrieve_for(
    config: &AppConfig,
    text: &str,
    top_k: Option<usize>,
    kb: Option<&Path>,
) -> Result<Vec<RetrievedRecord>> {
    let store = open_store(config, kb)?;
    let knowledge = load_published(&store).await?;
    let query = Query::new(text, top_k.unwrap_or(config.retrieval.top_k))?;
    let provider = HttpEmbedder::from_settings(&config.embedding)?;
    let retry = RetryPolicy::from(&IndexConfig::from(config));
    Ok(sitekb_core::retrieve(&knowledge, &query, &provider, &retry).await?)
}

async fn cmd_search(
    config: &AppConfig,
    query: &str,
    top_k: Option<usize>,
    kb: Option<&Path>,
) -> Result<()> {
    let results = retrieve_for(config, query, top_k, kb).await?;
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, r) in results.iter().enumerate() {
        println!(
            "{:>2}. [{:.3}] {} ({})",
            i + 1,
            r.score,
            r.record.title,
            r.record.content_type.as_str()
        );
        println!("    {}", r.record.source_url);
    }
    Ok(())
}

async fn cmd_ask(
    config: &AppConfig,
    question: &str,
    top_k: Option<usize>,
    kb: Option<&Path>,
) -> Result<()> {
    let generator = AnthropicGenerator::from_settings(&config.generation)?;
    let results = retrieve_for(config, question, top_k, kb).await?;

    let answer = sitekb_core::answer(
        question,
        &results,
        &generator,
        &GenerationOptions::from(&config.generation),
        ContextBudget::from(&config.retrieval),
    )
    .await?;

    println!("{}", answer.text.trim());
    if !answer.sources.is_empty() {
        println!();
        println!("Sources:");
        for (i, url) in answer.sources.iter().enumerate() {
            println!("  [{}] {url}", i + 1);
        }
    }
    Ok(())
}

fn cmd_status(config: &AppConfig, kb: Option<&Path>) -> Result<()> {
    let store = open_store(config, kb)?;
    let status = store.status()?;

    println!("  Path:        {}", status.root.display());
    match &status.current {
        Some(m) => {
            println!("  Site:        {}", m.site);
            println!("  Generation:  {}", m.generation);
            println!("  Created:     {}", m.created_at.to_rfc3339());
            println!("  Records:     {}", m.item_count);
            println!("  Dimensions:  {}", m.dimensions);
            println!("  Model:       {}", m.embedding_model);
        }
        None => println!("  Generation:  (none published)"),
    }
    println!("  On disk:     {} generation(s)", status.generations.len());
    if status.locked {
        println!("  Locked:      yes (a build is running or was interrupted)");
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner on stderr.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn page_extracted(&self, url: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Extracting [{current}/{total}] {url}"));
    }

    fn batch_embedded(&self, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Embedding batch {current}/{total}"));
    }

    fn done(&self, summary: &str) {
        self.spinner.println(format!("  {summary}"));
    }
}
