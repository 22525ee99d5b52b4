use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use smartstore::{IndexSpec, QuerySpec, SmartStore, SoupFeature, SoupSpec, StoreConfig, SOUP_ENTRY_ID};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database file. Falls back to SMARTSTORE_DB_PATH, then an in-memory store.
    #[arg(short, long)]
    db: Option<String>,

    /// Encryption key. Falls back to SMARTSTORE_KEY.
    #[arg(short, long)]
    key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// List soup names.
    Soups,
    /// Register a soup with `path:type` index specs.
    Register {
        soup: String,
        #[arg(required = true)]
        indexes: Vec<String>,
        /// Store documents in the encrypted blob store.
        #[arg(long)]
        external: bool,
    },
    Drop { soup: String },
    /// Insert or update a JSON document.
    Upsert {
        soup: String,
        json: String,
        /// Indexed path identifying the document.
        #[arg(long, default_value = SOUP_ENTRY_ID)]
        external_id: String,
    },
    Retrieve {
        soup: String,
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    Delete {
        soup: String,
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    /// Run a smart SQL query.
    Query {
        sql: String,
        #[arg(long, default_value_t = 10)]
        page_size: usize,
        #[arg(long, default_value_t = 0)]
        page: usize,
    },
    /// Count the rows of a smart SQL query.
    Count { sql: String },
    /// Show the index specs of a soup.
    Specs { soup: String },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = StoreConfig::from_env();
    if let Some(db) = &cli.db {
        let env_config = config;
        config = StoreConfig::new(db);
        config.encryption_key = env_config.encryption_key;
        config.external_storage_dir = env_config.external_storage_dir;
    }
    if let Some(key) = &cli.key {
        config.encryption_key = key.clone();
    }
    let store = SmartStore::open(config).context("failed to open store")?;

    match cli.command {
        Commands::Soups => {
            println!("{}", serde_json::to_string_pretty(&store.get_all_soup_names()?)?);
        }
        Commands::Register { soup, indexes, external } => {
            let specs = indexes
                .iter()
                .map(|text| IndexSpec::parse(text))
                .collect::<smartstore::Result<Vec<_>>>()?;
            let spec = if external {
                SoupSpec::with_features(&soup, &[SoupFeature::ExternalStorage])
            } else {
                SoupSpec::new(&soup)
            };
            store.register_soup_with_spec(&spec, &specs)?;
            println!("OK");
        }
        Commands::Drop { soup } => {
            if !store.drop_soup(&soup)? {
                bail!("no soup named {}", soup);
            }
            println!("OK");
        }
        Commands::Upsert { soup, json, external_id } => {
            let element: Value = serde_json::from_str(&json).context("document is not valid JSON")?;
            let saved = store.upsert(&soup, element, &external_id)?;
            println!("{}", serde_json::to_string_pretty(&saved)?);
        }
        Commands::Retrieve { soup, ids } => {
            let elements = store.retrieve(&soup, &ids)?;
            println!("{}", serde_json::to_string_pretty(&elements)?);
        }
        Commands::Delete { soup, ids } => {
            store.delete(&soup, &ids)?;
            println!("OK");
        }
        Commands::Query { sql, page_size, page } => {
            let rows = store.query(&QuerySpec::smart(&sql, page_size), page)?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Count { sql } => {
            println!("{}", store.count_query(&QuerySpec::smart(&sql, 1))?);
        }
        Commands::Specs { soup } => {
            let specs = store.get_soup_index_specs(&soup)?;
            println!("{}", serde_json::to_string_pretty(&specs)?);
        }
    }

    Ok(())
}
