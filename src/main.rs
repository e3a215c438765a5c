use chrono::Local;
use clap::Parser;
use livesync::livecore::types::{GroupId, UserId};
use livesync::router::Viewer;
use livesync::{CachedValue, QueryKey, Subscription, SyncClient, SyncConfig};
use log::{error, info, warn};

// Demo: joins a few chat groups, mirrors their live state to the log and
// prints push notifications until Ctrl-C.
//
// Usage:
//   cargo run -- --token <JWT> --user-id 3 --group 5 --group 9

#[derive(Parser, Debug)]
#[command(about = "Mirror live chat state into the log")]
struct Args {
    /// Bearer token for the socket, the REST API and the push stream.
    #[arg(long, env = "LIVESYNC_TOKEN")]
    token: String,

    /// Id of the signed-in user, used to filter self notifications.
    #[arg(long, default_value_t = 0)]
    user_id: i64,

    /// Group to join; repeat for several.
    #[arg(long = "group", short = 'g')]
    groups: Vec<i64>,

    #[arg(long)]
    socket_url: Option<String>,

    #[arg(long)]
    sse_url: Option<String>,

    #[arg(long)]
    api_url: Option<String>,
}

fn describe(value: &CachedValue) -> String {
    match value {
        CachedValue::Messages(messages) => match messages.last() {
            Some(last) => format!("{} messages, last: {:?}", messages.len(), last.content),
            None => "no messages".to_string(),
        },
        CachedValue::Typing(users) if users.is_empty() => "nobody typing".to_string(),
        CachedValue::Typing(users) => format!("{} typing", users.join(", ")),
        CachedValue::MessageInfo(info) => format!("read by {}", info.len()),
        CachedValue::Notifications(page) => format!("{} notifications", page.data.len()),
        CachedValue::MessageNotifications(list) => format!("{} groups with unread", list.len()),
    }
}

async fn mirror(mut subscription: Subscription) {
    let key = subscription.key();
    while let Some(value) = subscription.changed().await {
        info!(target: "Demo", "{key}: {}", describe(&value));
    }
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            return;
        }
    };

    rt.block_on(async {
        let mut config = SyncConfig::from_env();
        if let Some(url) = args.socket_url {
            config = config.with_socket_url(url);
        }
        if let Some(url) = args.sse_url {
            config = config.with_sse_url(url);
        }
        if let Some(url) = args.api_url {
            config = config.with_api_url(url);
        }

        let client = SyncClient::builder().with_config(config).build();
        if let Err(e) = client.connect(&args.token).await {
            error!("Failed to connect: {e}");
            return;
        }
        info!("Connected.");

        let groups: Vec<GroupId> = args.groups.iter().copied().map(GroupId).collect();
        let mut keys: Vec<QueryKey> = groups.iter().copied().map(QueryKey::GroupMessages).collect();
        keys.push(QueryKey::TypingUsers);
        keys.push(QueryKey::MessageNotifications);

        let mut mirrors = Vec::new();
        for key in keys {
            match client.subscribe(key) {
                Ok(subscription) => mirrors.push(tokio::spawn(mirror(subscription))),
                Err(e) => warn!("Could not subscribe to '{key}': {e}"),
            }
        }

        let viewer = Viewer::new(UserId(args.user_id), groups);
        if let Err(e) = client.start_notifications(viewer).await {
            warn!("Push notifications unavailable: {e}");
        }

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to wait for Ctrl-C: {e}");
        }
        info!("Shutting down.");
        for task in mirrors {
            task.abort();
        }
        client.shutdown().await;
    });
}
