use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use immo_watch::config;
use immo_watch::db::{self, ResultFilter};
use immo_watch::model::{Acceptance, NewFeature, NewSearch, NewSource};
use immo_watch::normalizer;
use immo_watch::registry::SourceRegistry;
use immo_watch::search;

#[derive(Debug, Parser)]
#[command(author, version, about = "Manage listing sources, searches and their results")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write an example config file if none exists
    Init,
    #[command(subcommand)]
    Sources(SourcesCmd),
    #[command(subcommand)]
    Users(UsersCmd),
    #[command(subcommand)]
    Projects(ProjectsCmd),
    #[command(subcommand)]
    Searches(SearchesCmd),
    /// Show how a URL would be bound, without storing anything
    Normalize { url: String },
    #[command(subcommand)]
    Features(FeaturesCmd),
    #[command(subcommand)]
    Results(ResultsCmd),
}

#[derive(Debug, Subcommand)]
enum SourcesCmd {
    List,
    Add {
        name: String,
        host_regex: String,
        /// `key=value` that sorts the site's results by date
        order_query_string: String,
    },
    /// List every source matching a URL, in match order
    Check { url: String },
}

#[derive(Debug, Subcommand)]
enum UsersCmd {
    Add {
        username: String,
        #[arg(long)]
        full_name: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum ProjectsCmd {
    Add {
        #[arg(long)]
        user: String,
        name: String,
    },
    List {
        #[arg(long)]
        user: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum SearchesCmd {
    Add {
        #[arg(long)]
        project: i64,
        url: String,
    },
    List {
        #[arg(long)]
        project: Option<i64>,
    },
    /// Re-resolve source and ordering for every stored search
    Rebind,
}

#[derive(Debug, Subcommand)]
enum FeaturesCmd {
    Add { key: String, label: String },
    List,
}

#[derive(Debug, Subcommand)]
enum ResultsCmd {
    List {
        #[arg(long)]
        search: i64,
        #[arg(long)]
        alive_only: bool,
        /// undecided, accepted or rejected
        #[arg(long)]
        status: Option<String>,
    },
    Show { id: i64 },
    Accept { id: i64 },
    Reject { id: i64 },
    Reset { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();

    let command = match args.command {
        Command::Init => {
            if args.config.exists() {
                bail!("{} already exists", args.config.display());
            }
            std::fs::write(&args.config, config::example())?;
            info!(path = %args.config.display(), "wrote example config");
            return Ok(());
        }
        other => other,
    };

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    db::seed_sources(&pool, &cfg.sources).await?;

    match command {
        Command::Init => Ok(()),
        Command::Sources(cmd) => sources(&pool, cmd).await,
        Command::Users(UsersCmd::Add {
            username,
            full_name,
        }) => {
            let id = db::get_or_create_user(&pool, &username, full_name.as_deref()).await?;
            println!("{id}\t{username}");
            Ok(())
        }
        Command::Projects(cmd) => projects(&pool, cmd).await,
        Command::Searches(cmd) => searches(&pool, cmd).await,
        Command::Normalize { url } => {
            let registry = SourceRegistry::load(&pool).await?;
            let bound = normalizer::bind_search(
                &registry,
                &NewSearch { project_id: 0, url },
            )?;
            println!("{bound}");
            Ok(())
        }
        Command::Features(cmd) => features(&pool, cmd).await,
        Command::Results(cmd) => results(&pool, cmd).await,
    }
}

async fn sources(pool: &db::Pool, cmd: SourcesCmd) -> Result<()> {
    match cmd {
        SourcesCmd::List => {
            let registry = SourceRegistry::load(pool).await?;
            for entry in registry.iter() {
                let s = entry.source();
                println!("{}\t{}\t{}\t{}", s.id, s.name, s.host_regex, s.order_query_string);
            }
        }
        SourcesCmd::Add {
            name,
            host_regex,
            order_query_string,
        } => {
            let id = db::insert_source(
                pool,
                &NewSource {
                    name,
                    host_regex,
                    order_query_string,
                },
            )
            .await?;
            println!("{id}");
        }
        SourcesCmd::Check { url } => {
            let registry = SourceRegistry::load(pool).await?;
            let matches: Vec<_> = registry.matching_sources(&url).collect();
            if matches.is_empty() {
                println!("no source matches");
            }
            for (i, s) in matches.iter().enumerate() {
                let marker = if i == 0 { "*" } else { " " };
                println!("{marker} {}\t{}", s.id(), s.name());
            }
        }
    }
    Ok(())
}

async fn projects(pool: &db::Pool, cmd: ProjectsCmd) -> Result<()> {
    match cmd {
        ProjectsCmd::Add { user, name } => {
            let owner = db::find_user(pool, &user)
                .await?
                .ok_or_else(|| anyhow!("unknown user {user}"))?;
            let id = db::create_project(pool, owner.id, &name).await?;
            println!("{id}");
        }
        ProjectsCmd::List { user } => {
            let user_id = match user {
                Some(name) => Some(
                    db::find_user(pool, &name)
                        .await?
                        .ok_or_else(|| anyhow!("unknown user {name}"))?
                        .id,
                ),
                None => None,
            };
            for p in db::list_projects(pool, user_id).await? {
                println!("{}\t{p}", p.id);
            }
        }
    }
    Ok(())
}

async fn searches(pool: &db::Pool, cmd: SearchesCmd) -> Result<()> {
    match cmd {
        SearchesCmd::Add { project, url } => {
            let registry = SourceRegistry::load(pool).await?;
            let created = search::create_search(pool, &registry, project, &url).await?;
            println!("{}\t{created}", created.id);
        }
        SearchesCmd::List { project } => {
            for s in db::search_summaries(pool, project).await? {
                println!(
                    "{}\t{}\tresults={} alive={} undecided={}",
                    s.search.id, s.search, s.results, s.alive, s.undecided
                );
            }
        }
        SearchesCmd::Rebind => {
            let registry = SourceRegistry::load(pool).await?;
            let report = search::rebind_all(pool, &registry).await?;
            println!("checked {} searches", report.checked);
            for (id, err) in &report.failed {
                println!("{id}\t{err}");
            }
        }
    }
    Ok(())
}

async fn features(pool: &db::Pool, cmd: FeaturesCmd) -> Result<()> {
    match cmd {
        FeaturesCmd::Add { key, label } => {
            let id = db::get_or_create_feature(pool, &NewFeature { label, key }).await?;
            println!("{id}");
        }
        FeaturesCmd::List => {
            for f in db::list_features(pool).await? {
                println!("{}\t{}\t{f}", f.id, f.key);
            }
        }
    }
    Ok(())
}

async fn results(pool: &db::Pool, cmd: ResultsCmd) -> Result<()> {
    match cmd {
        ResultsCmd::List {
            search,
            alive_only,
            status,
        } => {
            let acceptance = status
                .map(|s| Acceptance::parse(&s).ok_or_else(|| anyhow!("unknown status {s}")))
                .transpose()?;
            let filter = ResultFilter {
                alive_only,
                acceptance,
            };
            for r in db::list_results(pool, search, filter).await? {
                println!(
                    "{}\t{}\t{}\t{} {}\t{}\t{}",
                    r.id,
                    r.publication_date.format("%Y-%m-%d %H:%M"),
                    r.accepted.as_str(),
                    r.price,
                    r.city,
                    r,
                    r.url
                );
            }
        }
        ResultsCmd::Show { id } => {
            let r = db::get_result(pool, id)
                .await?
                .ok_or_else(|| anyhow!("result {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&r)?);
            for f in db::list_result_features(pool, id).await? {
                println!("{f}");
            }
        }
        ResultsCmd::Accept { id } => db::set_acceptance(pool, id, Acceptance::Accepted).await?,
        ResultsCmd::Reject { id } => db::set_acceptance(pool, id, Acceptance::Rejected).await?,
        ResultsCmd::Reset { id } => db::set_acceptance(pool, id, Acceptance::Undecided).await?,
    }
    Ok(())
}
