use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, info};

use crate::aggregator::{self, parse_interval};
use crate::config::Config;
use crate::db::{Database, User};
use crate::error::{Error, Result};
use crate::fetcher::Fetcher;

/// Everything a handler may touch, passed explicitly into every call.
pub struct State {
    pub config: Config,
    pub db: Database,
    pub fetcher: Fetcher,
}

impl State {
    pub async fn new(config: Config) -> Result<Self> {
        let db = Database::new(&config.db_url).await?;
        db.initialize().await?;
        let fetcher = Fetcher::new()?;

        Ok(Self {
            config,
            db,
            fetcher,
        })
    }

    /// Resolves the configured user name to its row.
    pub async fn current_user(&self) -> Result<User> {
        if !self.config.is_logged_in() {
            return Err(Error::NotLoggedIn);
        }
        let name = &self.config.current_user_name;
        self.db
            .get_user(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {:?}", name)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    pub fn new(name: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Builds a command from the process arguments, program name included.
    pub fn from_argv<I: IntoIterator<Item = String>>(argv: I) -> Result<Self> {
        let mut argv = argv.into_iter().skip(1);
        let name = argv
            .next()
            .ok_or_else(|| Error::usage("gator", "gator <command> [args...]"))?;

        Ok(Self {
            name,
            args: argv.collect(),
        })
    }

    fn expect_args(&self, count: usize, usage: &str) -> Result<()> {
        if self.args.len() == count {
            return Ok(());
        }
        let plural = if count == 1 { "" } else { "s" };
        Err(Error::usage(
            &self.name,
            &format!(
                "{} (expected {} argument{}, received {})",
                usage,
                count,
                plural,
                self.args.len()
            ),
        ))
    }
}

pub type HandlerFuture<'a> = BoxFuture<'a, Result<()>>;
pub type Handler =
    Box<dyn for<'a> Fn(&'a mut State, &'a Command) -> HandlerFuture<'a> + Send + Sync>;

fn into_handler<F>(f: F) -> Handler
where
    F: for<'a> Fn(&'a mut State, &'a Command) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    Box::new(f)
}

/// Wraps a handler that needs the current user. The user is resolved once,
/// before the inner handler runs.
pub fn logged_in<F>(handler: F) -> Handler
where
    F: for<'a> Fn(&'a mut State, &'a Command, User) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    into_handler(move |state, cmd| {
        let handler = Arc::clone(&handler);
        async move {
            let user = state.current_user().await?;
            debug!("Running {} as {}", cmd.name, user.name);
            (*handler)(state, cmd, user).await
        }
        .boxed()
    })
}

#[derive(Default)]
pub struct Commands {
    handlers: HashMap<String, Handler>,
}

impl Commands {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full command-line surface.
    pub fn with_defaults() -> Self {
        let mut commands = Self::new();
        commands.register("register", |s, c| handler_register(s, c).boxed());
        commands.register("login", |s, c| handler_login(s, c).boxed());
        commands.register("reset", |s, c| handler_reset(s, c).boxed());
        commands.register("users", |s, c| handler_users(s, c).boxed());
        commands.register("agg", |s, c| handler_agg(s, c).boxed());
        commands.register("feeds", |s, c| handler_feeds(s, c).boxed());
        commands.register(
            "addfeed",
            logged_in(|s, c, u| handler_add_feed(s, c, u).boxed()),
        );
        commands.register("follow", logged_in(|s, c, u| handler_follow(s, c, u).boxed()));
        commands.register(
            "following",
            logged_in(|s, c, u| handler_following(s, c, u).boxed()),
        );
        commands.register(
            "unfollow",
            logged_in(|s, c, u| handler_unfollow(s, c, u).boxed()),
        );
        commands.register("browse", logged_in(|s, c, u| handler_browse(s, c, u).boxed()));
        commands
    }

    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: for<'a> Fn(&'a mut State, &'a Command) -> HandlerFuture<'a> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), into_handler(handler));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub async fn run(&self, state: &mut State, cmd: &Command) -> Result<()> {
        let handler = self
            .handlers
            .get(&cmd.name)
            .ok_or_else(|| Error::UnknownCommand(cmd.name.clone()))?;
        handler(state, cmd).await
    }
}

pub async fn handler_register(state: &mut State, cmd: &Command) -> Result<()> {
    cmd.expect_args(1, "register <name>")?;
    let name = &cmd.args[0];

    let user = state.db.create_user(name).await?;
    state.config.set_user(&user.name)?;
    info!("Registered user {}", user.name);

    println!("New user created:");
    println!("\tid: {}", user.id);
    println!("\tcreated at: {}", user.created_at);
    println!("\tupdated at: {}", user.updated_at);
    println!("\tname: {}", user.name);
    Ok(())
}

pub async fn handler_login(state: &mut State, cmd: &Command) -> Result<()> {
    cmd.expect_args(1, "login <name>")?;
    let name = &cmd.args[0];

    let user = state
        .db
        .get_user(name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("user {:?}", name)))?;
    state.config.set_user(&user.name)?;

    println!("User {} logged in.", user.name);
    Ok(())
}

pub async fn handler_reset(state: &mut State, cmd: &Command) -> Result<()> {
    cmd.expect_args(0, "reset")?;

    state.db.reset().await?;
    info!("Database reset");

    println!("Database cleared");
    Ok(())
}

pub async fn handler_users(state: &mut State, cmd: &Command) -> Result<()> {
    cmd.expect_args(0, "users")?;

    for user in state.db.get_users().await? {
        if user.name == state.config.current_user_name {
            println!("* {} (current)", user.name);
        } else {
            println!("* {}", user.name);
        }
    }
    Ok(())
}

/// Never returns on success; only a bad interval ends it.
pub async fn handler_agg(state: &mut State, cmd: &Command) -> Result<()> {
    cmd.expect_args(1, "agg <duration>")?;
    let interval = parse_interval(&cmd.args[0])?;

    println!("Collecting feeds every {}", cmd.args[0]);
    aggregator::run(&state.db, &state.fetcher, interval).await
}

pub async fn handler_feeds(state: &mut State, cmd: &Command) -> Result<()> {
    cmd.expect_args(0, "feeds")?;

    for (i, feed) in state.db.get_feeds().await?.iter().enumerate() {
        println!("--- Feed {} ---", i + 1);
        println!("\t- Name: {}", feed.name);
        println!("\t- Url: {}", feed.url);
        println!("\t- User: {}", feed.user_name);
    }
    Ok(())
}

pub async fn handler_add_feed(state: &mut State, cmd: &Command, user: User) -> Result<()> {
    cmd.expect_args(2, "addfeed <name> <url>")?;
    let (name, url) = (&cmd.args[0], &cmd.args[1]);

    let feed = state.db.create_feed(name, url, user.id).await?;
    info!("User {} added feed {}", user.name, feed.url);

    println!("Feed ID: {}", feed.id);
    println!("Feed created at: {}", feed.created_at);
    println!("Feed updated at: {}", feed.updated_at);
    println!("Feed name: {}", feed.name);
    println!("Feed url: {}", feed.url);
    println!("Feed user ID: {}", feed.user_id);

    let follow = state.db.create_feed_follow(user.id, feed.id).await?;
    println!("User: {}, Follows: {}", follow.user_name, follow.feed_name);
    Ok(())
}

pub async fn handler_follow(state: &mut State, cmd: &Command, user: User) -> Result<()> {
    cmd.expect_args(1, "follow <url>")?;
    let url = &cmd.args[0];

    let feed = state
        .db
        .get_feed_by_url(url)
        .await?
        .ok_or_else(|| Error::NotFound(format!("feed {:?}", url)))?;
    let follow = state.db.create_feed_follow(user.id, feed.id).await?;

    println!("User: {}, Follows: {}", follow.user_name, follow.feed_name);
    Ok(())
}

pub async fn handler_following(state: &mut State, cmd: &Command, user: User) -> Result<()> {
    cmd.expect_args(0, "following")?;

    let feeds = state.db.get_feed_follows_for_user(user.id).await?;
    println!("--- Feeds followed by {} ---", user.name);
    for feed in feeds {
        println!("\t* {}", feed.feed_name);
    }
    Ok(())
}

pub async fn handler_unfollow(state: &mut State, cmd: &Command, user: User) -> Result<()> {
    cmd.expect_args(1, "unfollow <url>")?;
    let url = &cmd.args[0];

    let feed = state
        .db
        .get_feed_by_url(url)
        .await?
        .ok_or_else(|| Error::NotFound(format!("feed {:?}", url)))?;
    if state.db.delete_feed_follow(user.id, feed.id).await? == 0 {
        return Err(Error::NotFound(format!("follow of {:?} by {}", url, user.name)));
    }

    println!("User: {}, Unfollowed: {}", user.name, feed.name);
    Ok(())
}

pub async fn handler_browse(state: &mut State, cmd: &Command, user: User) -> Result<()> {
    cmd.expect_args(1, "browse <limit>")?;
    let limit = parse_limit(&cmd.args[0])?;

    for post in state.db.get_posts_for_user(user.id, limit).await? {
        println!("--- Feed {} ---", post.feed_name);
        println!("\t* Title: {}", post.title.as_deref().unwrap_or_default());
        println!("\t* Url: {}", post.url);
        println!(
            "\t* Description: {}",
            post.description.as_deref().unwrap_or_default()
        );
        match post.published_at {
            Some(published) => println!("\t* Published at: {}", published),
            None => println!("\t* Published at: unknown"),
        }
    }
    Ok(())
}

fn parse_limit(text: &str) -> Result<i64> {
    match text.parse::<i32>() {
        Ok(limit) if limit > 0 => Ok(i64::from(limit)),
        _ => Err(Error::InvalidLimit(text.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    async fn create_test_state(current_user: &str) -> (State, NamedTempFile) {
        let mut config_file = NamedTempFile::new().unwrap();
        let content = format!(
            r#"{{"db_url": "sqlite::memory:", "current_user_name": "{}"}}"#,
            current_user
        );
        config_file.write_all(content.as_bytes()).unwrap();

        let config = Config::load(config_file.path()).unwrap();
        let state = State::new(config).await.unwrap();
        (state, config_file)
    }

    mod argv_tests {
        use super::*;

        #[test]
        fn test_from_argv_splits_name_and_args() {
            let argv = ["gator", "addfeed", "Example", "https://example.com/feed"]
                .map(String::from);
            let cmd = Command::from_argv(argv).unwrap();

            assert_eq!(cmd, Command::new("addfeed", &["Example", "https://example.com/feed"]));
        }

        #[test]
        fn test_from_argv_without_command_is_usage_error() {
            let result = Command::from_argv(vec!["gator".to_string()]);
            assert!(matches!(result, Err(Error::Usage { .. })));
        }

        #[test]
        fn test_expect_args_reports_counts() {
            let cmd = Command::new("login", &[]);
            let err = cmd.expect_args(1, "login <name>").unwrap_err();
            assert_eq!(
                err.to_string(),
                "usage: login <name> (expected 1 argument, received 0)"
            );
        }

        #[test]
        fn test_parse_limit() {
            assert_eq!(parse_limit("5").unwrap(), 5);
            for text in ["0", "-2", "abc", "", "99999999999"] {
                assert!(matches!(parse_limit(text), Err(Error::InvalidLimit(_))));
            }
        }
    }

    mod dispatch_tests {
        use super::*;

        #[tokio::test]
        async fn test_unknown_command() {
            let (mut state, _file) = create_test_state("").await;
            let commands = Commands::with_defaults();

            let result = commands.run(&mut state, &Command::new("nope", &[])).await;
            assert!(matches!(result, Err(Error::UnknownCommand(name)) if name == "nope"));
        }

        #[tokio::test]
        async fn test_all_commands_registered() {
            let commands = Commands::with_defaults();
            for name in [
                "register", "login", "reset", "users", "agg", "addfeed", "feeds", "follow",
                "following", "unfollow", "browse",
            ] {
                assert!(commands.contains(name), "{} missing", name);
            }
        }

        #[tokio::test]
        async fn test_custom_handler_receives_args() {
            let (mut state, _file) = create_test_state("").await;
            let mut commands = Commands::new();
            commands.register("echo", |_, c| {
                async move {
                    assert_eq!(c.args, vec!["hi".to_string()]);
                    Ok::<_, Error>(())
                }
                .boxed()
            });

            commands
                .run(&mut state, &Command::new("echo", &["hi"]))
                .await
                .unwrap();
        }

        #[tokio::test]
        async fn test_wrong_arg_count_is_usage_error() {
            let (mut state, _file) = create_test_state("").await;
            let commands = Commands::with_defaults();

            let result = commands
                .run(&mut state, &Command::new("register", &["a", "b"]))
                .await;
            assert!(matches!(result, Err(Error::Usage { command, .. }) if command == "register"));
            assert!(state.db.get_users().await.unwrap().is_empty());
        }
    }

    mod logged_in_tests {
        use super::*;

        #[tokio::test]
        async fn test_logged_out_fails_without_writes() {
            let (mut state, _file) = create_test_state("").await;
            let commands = Commands::with_defaults();

            for cmd in [
                Command::new("addfeed", &["Example", "https://example.com/feed"]),
                Command::new("follow", &["https://example.com/feed"]),
                Command::new("following", &[]),
                Command::new("unfollow", &["https://example.com/feed"]),
                Command::new("browse", &["2"]),
            ] {
                let result = commands.run(&mut state, &cmd).await;
                assert!(matches!(result, Err(Error::NotLoggedIn)), "{}", cmd.name);
            }

            assert!(state.db.get_feeds().await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_configured_user_must_exist() {
            let (mut state, _file) = create_test_state("ghost").await;
            let commands = Commands::with_defaults();

            let result = commands
                .run(&mut state, &Command::new("following", &[]))
                .await;
            assert!(matches!(result, Err(Error::NotFound(_))));
        }

        #[tokio::test]
        async fn test_wrapper_passes_resolved_user() {
            let (mut state, _file) = create_test_state("alice").await;
            state.db.create_user("alice").await.unwrap();

            let mut commands = Commands::new();
            commands.register(
                "whoami",
                logged_in(|_, _, user| {
                    async move {
                        assert_eq!(user.name, "alice");
                        Ok::<_, Error>(())
                    }
                    .boxed()
                }),
            );

            commands
                .run(&mut state, &Command::new("whoami", &[]))
                .await
                .unwrap();
        }
    }

    mod handler_tests {
        use super::*;

        #[tokio::test]
        async fn test_register_logs_in() {
            let (mut state, file) = create_test_state("").await;
            let commands = Commands::with_defaults();

            commands
                .run(&mut state, &Command::new("register", &["alice"]))
                .await
                .unwrap();

            assert_eq!(state.config.current_user_name, "alice");
            assert_eq!(Config::load(file.path()).unwrap().current_user_name, "alice");
            assert!(state.db.get_user("alice").await.unwrap().is_some());
        }

        #[tokio::test]
        async fn test_register_duplicate_fails() {
            let (mut state, _file) = create_test_state("").await;
            let commands = Commands::with_defaults();
            let cmd = Command::new("register", &["alice"]);

            commands.run(&mut state, &cmd).await.unwrap();
            let result = commands.run(&mut state, &cmd).await;
            assert!(matches!(result, Err(Error::AlreadyExists(_))));
        }

        #[tokio::test]
        async fn test_login_unknown_user_keeps_config() {
            let (mut state, file) = create_test_state("alice").await;
            let commands = Commands::with_defaults();

            let result = commands
                .run(&mut state, &Command::new("login", &["bob"]))
                .await;
            assert!(matches!(result, Err(Error::NotFound(_))));
            assert_eq!(Config::load(file.path()).unwrap().current_user_name, "alice");
        }

        #[tokio::test]
        async fn test_agg_rejects_bad_duration_immediately() {
            let (mut state, _file) = create_test_state("").await;
            let commands = Commands::with_defaults();

            let result = commands
                .run(&mut state, &Command::new("agg", &["soon"]))
                .await;
            assert!(matches!(result, Err(Error::InvalidDuration(_))));
        }

        #[tokio::test]
        async fn test_addfeed_creates_feed_and_follow() {
            let (mut state, _file) = create_test_state("alice").await;
            let alice = state.db.create_user("alice").await.unwrap();
            let commands = Commands::with_defaults();

            commands
                .run(
                    &mut state,
                    &Command::new("addfeed", &["Example", "https://example.com/feed"]),
                )
                .await
                .unwrap();

            let feed = state
                .db
                .get_feed_by_url("https://example.com/feed")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(feed.user_id, alice.id);

            let follows = state.db.get_feed_follows_for_user(alice.id).await.unwrap();
            assert_eq!(follows.len(), 1);
            assert_eq!(follows[0].feed_id, feed.id);
        }

        #[tokio::test]
        async fn test_follow_unknown_feed() {
            let (mut state, _file) = create_test_state("alice").await;
            state.db.create_user("alice").await.unwrap();
            let commands = Commands::with_defaults();

            let result = commands
                .run(&mut state, &Command::new("follow", &["https://nowhere.com/rss"]))
                .await;
            assert!(matches!(result, Err(Error::NotFound(_))));
        }

        #[tokio::test]
        async fn test_unfollow_without_follow_is_not_found() {
            let (mut state, _file) = create_test_state("alice").await;
            let alice = state.db.create_user("alice").await.unwrap();
            state
                .db
                .create_feed("Example", "https://example.com/feed", alice.id)
                .await
                .unwrap();
            let commands = Commands::with_defaults();

            let result = commands
                .run(&mut state, &Command::new("unfollow", &["https://example.com/feed"]))
                .await;
            assert!(matches!(result, Err(Error::NotFound(_))));
        }

        #[tokio::test]
        async fn test_browse_rejects_bad_limit() {
            let (mut state, _file) = create_test_state("alice").await;
            state.db.create_user("alice").await.unwrap();
            let commands = Commands::with_defaults();

            let result = commands
                .run(&mut state, &Command::new("browse", &["0"]))
                .await;
            assert!(matches!(result, Err(Error::InvalidLimit(_))));
        }

        #[tokio::test]
        async fn test_reset_keeps_config() {
            let (mut state, _file) = create_test_state("alice").await;
            state.db.create_user("alice").await.unwrap();
            let commands = Commands::with_defaults();

            commands
                .run(&mut state, &Command::new("reset", &[]))
                .await
                .unwrap();

            assert!(state.db.get_users().await.unwrap().is_empty());
            assert_eq!(state.config.current_user_name, "alice");
        }
    }
}
