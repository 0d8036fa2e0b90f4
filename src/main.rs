use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use orangered::data::FeedService;
use orangered::{auth, config, content, data, proxy, reddit, session, storage};

fn main() {
    if handle_cli_flags() {
        return;
    }

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_default();
    let result = match command.as_str() {
        "serve" => serve(),
        "login" => login(),
        "feed" => feed(args.collect()),
        "" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("unknown command: {other}");
            std::process::exit(2);
        }
    };

    if let Err(err) = result {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn handle_cli_flags() -> bool {
    let mut saw_flag = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("Orangered {}", orangered::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                print_help();
                saw_flag = true;
            }
            _ => {}
        }
    }
    saw_flag
}

fn print_help() {
    println!(
        "Orangered - Reddit client core with a confidential OAuth proxy.\n\n  serve                Run the OAuth proxy (requires reddit.client_id and client_secret)\n  login                Sign in via the browser (requires a running proxy)\n  feed <subreddit> [hot|new|top] [day|month|year|all]\n                       Print a ranked listing using the saved session\n  --version, -V        Show version and exit\n  --help,    -h        Show this help message"
    );
}

fn serve() -> Result<()> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    let proxy = proxy::Proxy::bind(proxy::Config {
        listen: cfg.proxy.listen.clone(),
        allowed_origin: cfg.proxy.allowed_origin.clone(),
        client_id: cfg.reddit.client_id.clone(),
        client_secret: cfg.reddit.client_secret.clone(),
        user_agent: cfg.reddit.user_agent.clone(),
        redirect_uri: cfg.reddit.redirect_uri.clone(),
        http_timeout: cfg.api.http_timeout,
        ..proxy::Config::default()
    })
    .context("bind proxy")?;
    println!("Proxy listening on http://{}", proxy.addr());
    proxy.start().join();
    Ok(())
}

fn login() -> Result<()> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    let store =
        Arc::new(storage::Store::open(storage::Options::default()).context("open storage")?);
    let flow = Arc::new(auth::Flow::new(store, auth_config(&cfg)).context("build auth flow")?);

    let request = flow.begin().context("begin authorization")?;
    if webbrowser::open(&request.browser_url).is_err() {
        println!("Open this URL to authorize:\n{}", request.browser_url);
    }
    println!("Waiting for the authorization redirect...");

    let params = request.wait()?;
    let mut handler = auth::CallbackHandler::new(flow);
    let outcome = handler
        .handle(&params)
        .context("complete authorization")?;

    println!(
        "Logged in as {} (link karma {}, comment karma {}).",
        outcome.profile.name, outcome.profile.link_karma, outcome.profile.comment_karma
    );
    Ok(())
}

fn feed(args: Vec<String>) -> Result<()> {
    let subreddit = args.first().cloned().unwrap_or_default();
    let sort = args
        .get(1)
        .map(|key| sort_from_key(key))
        .unwrap_or_default();
    let timespan = args
        .get(2)
        .map(|key| timespan_from_key(key))
        .unwrap_or_default();

    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    let store =
        Arc::new(storage::Store::open(storage::Options::default()).context("open storage")?);
    let flow = Arc::new(auth::Flow::new(store.clone(), auth_config(&cfg))?);
    let manager = Arc::new(session::Manager::new(store, flow));

    if manager.rehydrate()? == session::RehydrateOutcome::LoggedOut {
        anyhow::bail!("no saved session; run `orangered login` first");
    }

    let client = Arc::new(reddit::Client::new(
        manager.token_provider(),
        reddit::ClientConfig {
            user_agent: cfg.reddit.user_agent.clone(),
            ..reddit::ClientConfig::default()
        },
    )?);
    let feed = data::RedditFeedService::new(client);
    let items = feed.load_subreddit(&subreddit, sort, timespan)?;
    let ranked = content::rank(items, sort, timespan, content::PageContext::Subreddit);

    for item in &ranked {
        if let reddit::Item::Post(post) = item {
            println!("{:>6}  {}", post.score.or_zero(), post.title);
        }
    }
    Ok(())
}

fn auth_config(cfg: &config::Config) -> auth::Config {
    auth::Config {
        client_id: cfg.reddit.client_id.clone(),
        scope: cfg.reddit.scopes.clone(),
        user_agent: cfg.reddit.user_agent.clone(),
        api_base: cfg.api.base_url.clone(),
        redirect_uri: cfg.reddit.redirect_uri.clone(),
        http_timeout: cfg.api.http_timeout,
        ..auth::Config::default()
    }
}

fn sort_from_key(key: &str) -> reddit::SortOption {
    match key {
        "new" => reddit::SortOption::New,
        "top" => reddit::SortOption::Top,
        _ => reddit::SortOption::Hot,
    }
}

fn timespan_from_key(key: &str) -> reddit::Timespan {
    match key {
        "day" => reddit::Timespan::Day,
        "month" => reddit::Timespan::Month,
        "year" => reddit::Timespan::Year,
        _ => reddit::Timespan::All,
    }
}
