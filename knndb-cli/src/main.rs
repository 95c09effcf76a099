use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use knndb_core::{crud, Config, Database, LogLevel};
use serde_json::{json, Map, Value};

#[derive(Parser)]
#[command(name = "knndb")]
#[command(about = "knndb - embedded document database with ANN vector search")]
#[command(version)]
struct Cli {
    /// Path to the data folder
    #[arg(long, default_value = "./data")]
    data_path: PathBuf,

    /// Cap on live documents per storage segment
    #[arg(long, default_value_t = knndb_core::DEFAULT_MAX_STORAGE_ELEMENTS)]
    max_storage_elements: usize,

    /// Log level: error, warn, info, debug, trace
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the database and run the maintenance loops until stopped
    Serve {
        /// API port the embedding HTTP server binds to
        #[arg(long, default_value_t = 3399)]
        api_port: u16,
        /// API address the embedding HTTP server binds to
        #[arg(long, default_value = "127.0.0.1")]
        api_address: String,
    },
    /// Import documents from a JSON file: { "collection": [docs...], ... }
    Import {
        /// JSON file to import
        file: PathBuf,
    },
    /// Export every collection (or one) to a JSON file
    Export {
        /// Output JSON file
        file: PathBuf,
        /// Export only this collection
        #[arg(long)]
        collection: Option<String>,
    },
    /// Run a query against one collection and print the response
    Query {
        /// Collection name
        collection: String,
        /// Query document as JSON, e.g. '{"color":"red","#limit":10}'
        query: String,
        /// Projection document as JSON, e.g. '{"title":true}'
        #[arg(long)]
        projection: Option<String>,
    },
    /// Print document and index counts per collection
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    knndb_core::init_from_env();
    if let Some(level) = cli.log_level.as_deref() {
        let parsed = LogLevel::parse(level)
            .with_context(|| format!("unknown log level: {}", level))?;
        knndb_core::set_log_level(parsed);
    }

    let mut config = Config::with_data_path(&cli.data_path);
    config.max_storage_elements = cli.max_storage_elements;

    match cli.command {
        Commands::Serve {
            api_port,
            api_address,
        } => {
            config.api_port = api_port;
            config.api_address = api_address;
            serve(config)
        }
        Commands::Import { file } => import_data(config, &file),
        Commands::Export { file, collection } => export_data(config, &file, collection.as_deref()),
        Commands::Query {
            collection,
            query,
            projection,
        } => run_query(config, &collection, &query, projection.as_deref()),
        Commands::Stats => print_stats(config),
    }
}

fn open_database(config: Config) -> Result<Arc<Database>> {
    let path = config.data_path.clone();
    Database::load(config)
        .with_context(|| format!("failed to open database at {}", path.display()))
}

/// Load everything and keep the periodic manager running. Documents flush
/// every few minutes and once more when the process is asked to stop, so
/// plain termination loses at most the last unflushed window.
fn serve(config: Config) -> Result<()> {
    println!("[VAR] dataPath set to {}", config.data_path.display());
    println!(
        "[VAR] api configured at {}:{} (for the embedding HTTP server)",
        config.api_address, config.api_port
    );

    let db = open_database(config)?;
    println!(
        "loaded {} collections; indexes are building in the background",
        db.collection_names().len()
    );

    let manager = db.start_manager();
    println!("manager loop running; stop the process to exit");
    manager
        .join()
        .map_err(|_| anyhow::anyhow!("manager loop panicked"))?;
    Ok(())
}

/// Import from `{ "collection": [documents...], ... }`.
fn import_data(config: Config, file: &PathBuf) -> Result<()> {
    let content = fs::read_to_string(file)
        .with_context(|| format!("failed to read file: {}", file.display()))?;
    let data: Map<String, Value> = serde_json::from_str(&content)
        .with_context(|| format!("invalid JSON in file: {}", file.display()))?;

    let db = open_database(config)?;
    let response = crud::create(&db, &Value::Object(data));
    if response["status"] != "ok" {
        anyhow::bail!("import failed: {}", response["error"]);
    }

    db.save();
    let count = response["newIds"].as_array().map(|a| a.len()).unwrap_or(0);
    println!("imported {} documents", count);
    Ok(())
}

fn export_data(config: Config, file: &PathBuf, only: Option<&str>) -> Result<()> {
    let db = open_database(config)?;

    let mut exported: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for collection in db.collections() {
        if let Some(name) = only {
            if collection.name != name {
                continue;
            }
        }
        let mut documents = Vec::new();
        for segment in collection.segments() {
            segment
                .for_each(|doc| documents.push(doc.clone()))
                .with_context(|| format!("failed reading collection '{}'", collection.name))?;
        }
        exported.insert(collection.name.clone(), documents);
    }

    if let Some(name) = only {
        if !exported.contains_key(name) {
            anyhow::bail!("collection not found: {}", name);
        }
    }

    let total: usize = exported.values().map(|docs| docs.len()).sum();
    fs::write(file, serde_json::to_string_pretty(&exported)?)
        .with_context(|| format!("failed to write file: {}", file.display()))?;
    println!(
        "exported {} documents from {} collections",
        total,
        exported.len()
    );
    Ok(())
}

fn run_query(
    config: Config,
    collection: &str,
    query: &str,
    projection: Option<&str>,
) -> Result<()> {
    let query: Value =
        serde_json::from_str(query).context("query has to be a JSON object")?;

    let mut request = json!({ "collection": collection, "query": query });
    if let Some(projection) = projection {
        let projection: Value =
            serde_json::from_str(projection).context("projection has to be a JSON object")?;
        request["projection"] = projection;
    }

    let db = open_database(config)?;
    // Queries run against freshly built indexes; building happens in the
    // background on load, so force one synchronous pass here.
    if let Some(col) = db.collection(collection) {
        col.build_indexes();
    }

    let response = crud::select(&db, &request);
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn print_stats(config: Config) -> Result<()> {
    let db = open_database(config)?;

    for name in db.collection_names() {
        if let Some(collection) = db.collection(&name) {
            let catalog = collection.catalog();
            let mut index_names: Vec<&str> = catalog.keys().map(String::as_str).collect();
            index_names.sort_unstable();
            println!(
                "{}: {} documents, {} segments, indexes: [{}]",
                name,
                collection.count_documents(),
                collection.segments().len(),
                index_names.join(", ")
            );
        }
    }
    Ok(())
}
