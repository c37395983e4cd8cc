use clap::{Parser, Subcommand};
use roomchat::{
    ApiError, ChatApi, ChatBackend, ChatClient, ChatConfig, ConnectionError, LeaveOutcome, MessageStream, Rendered,
    RoomSummary, RoomType, SessionError, SessionEvent, TransportKind,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("http request failed: {0}")]
    Api(#[from] ApiError),
    #[error("session failed: {0}")]
    Session(#[from] SessionError),
    #[error("publish failed: {0}")]
    Connection(#[from] ConnectionError),
    #[error("stdin read failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "roomchat", about = "Chat room session CLI")]
struct Cli {
    #[arg(long, env = "CHAT_API_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "CHAT_AUTH_TOKEN")]
    token: Option<String>,

    #[arg(long, env = "CHAT_TRANSPORT")]
    transport: Option<TransportKind>,

    /// Acting user id.
    #[arg(long, env = "CHAT_USER_ID")]
    user: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List rooms the user belongs to.
    Rooms {
        #[arg(long, default_value_t = false)]
        one_to_one: bool,
    },
    /// Print a room's stored history.
    History { room_id: String },
    /// Join a room, send stdin lines as messages, leave on EOF.
    Chat {
        room_id: String,
        #[arg(long, default_value = "ONE_TO_ONE")]
        room_type: RoomType,
    },
    Invite {
        room_id: String,
        #[arg(long)]
        recipient: String,
    },
    Kick {
        room_id: String,
        #[arg(long)]
        recipient: String,
        #[arg(long, default_value = "")]
        room_name: String,
    },
    /// Show who could be invited to or kicked from a room.
    Candidates { room_id: String },
    CreateRoom {
        #[arg(long)]
        friend: String,
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = ChatConfig::from_env();
    if let Some(base_url) = cli.base_url {
        config.api_base_url = base_url;
    }
    if cli.token.is_some() {
        config.auth_token = cli.token;
    }
    if let Some(transport) = cli.transport {
        config.transport = transport;
    }

    match cli.command {
        Command::Rooms { one_to_one } => run_rooms(&config, &cli.user, one_to_one).await,
        Command::History { room_id } => run_history(&config, &cli.user, &room_id).await,
        Command::Chat { room_id, room_type } => run_chat(config, &cli.user, &room_id, room_type).await,
        Command::Invite { room_id, recipient } => {
            let client = ChatClient::new(config)?;
            client.directory().invite(None, &room_id, &cli.user, &recipient).await?;
            println!("invited {recipient}");
            Ok(())
        }
        Command::Kick { room_id, recipient, room_name } => {
            let client = ChatClient::new(config)?;
            client.directory().kick(None, &room_id, &cli.user, &recipient, &room_name).await?;
            println!("kicked {recipient}");
            Ok(())
        }
        Command::Candidates { room_id } => run_candidates(config, &cli.user, &room_id).await,
        Command::CreateRoom { friend, name } => {
            let api = ChatApi::new(&config)?;
            let room = api.create_one_to_one_room(&cli.user, &friend, name.as_deref()).await;
            print_room(&room);
            Ok(())
        }
    }
}

async fn run_rooms(config: &ChatConfig, user: &str, one_to_one: bool) -> Result<(), CliError> {
    let api = ChatApi::new(config)?;
    let rooms = if one_to_one {
        api.list_one_to_one_rooms(user).await?
    } else {
        api.list_rooms(user).await?
    };
    for room in &rooms {
        print_room(room);
    }
    Ok(())
}

async fn run_history(config: &ChatConfig, user: &str, room_id: &str) -> Result<(), CliError> {
    let api = ChatApi::new(config)?;
    let stream = MessageStream::new();
    stream.seed_history(api.fetch_history(room_id).await?);
    for entry in stream.rendered(user) {
        print_entry(&entry);
    }
    Ok(())
}

async fn run_candidates(config: ChatConfig, user: &str, room_id: &str) -> Result<(), CliError> {
    let client = ChatClient::new(config)?;
    let (friends, members) = tokio::join!(
        client.directory().list_invitable_friends(user, room_id),
        client.directory().list_kick_candidates(user, room_id),
    );
    for friend in friends {
        println!("invite\t{}\t{}", friend.id, friend.name);
    }
    for member in members {
        println!("kick\t{}\t{}", member.user_id, member.display_name);
    }
    Ok(())
}

async fn run_chat(config: ChatConfig, user: &str, room_id: &str, room_type: RoomType) -> Result<(), CliError> {
    let client = ChatClient::new(config)?;
    let mut session = client.open_session(room_id, user, room_type).await?;

    let printer = tokio::spawn({
        let stream = session.stream().clone();
        let mut updates = stream.updates();
        let user = user.to_owned();
        async move {
            let mut shown = 0;
            loop {
                let rendered = stream.rendered(&user);
                for entry in rendered.iter().skip(shown) {
                    print_entry(entry);
                }
                shown = rendered.len();
                if updates.changed().await.is_err() {
                    break;
                }
            }
        }
    });

    let notifier = session.take_events().map(|mut events| {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::Alert(alert) => eprintln!("! {alert}"),
                    SessionEvent::Invitation(text) => eprintln!("* {text}"),
                    SessionEvent::Disconnected => eprintln!("! disconnected"),
                }
            }
        })
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match session.send_message(&line) {
            Ok(()) | Err(SessionError::EmptyMessage) => {}
            Err(e) => {
                tracing::warn!(error = %e, "chat: send failed");
                break;
            }
        }
    }

    let outcome = session.close().await;
    printer.abort();
    if let Some(notifier) = notifier {
        notifier.abort();
    }
    if outcome == LeaveOutcome::Skipped {
        eprintln!("! left without announcing LEAVE");
    }
    Ok(())
}

fn print_room(room: &RoomSummary) {
    let kind = if room.is_group { "group" } else { "one-to-one" };
    println!("{}\t{}\t{kind}\t{}", room.id, room.name, room.participants.join(","));
}

fn print_entry(entry: &Rendered) {
    match entry {
        Rendered::Bubble { mine: true, content, .. } => println!("> {content}"),
        Rendered::Bubble { mine: false, sender, content } => println!("{sender}: {content}"),
        Rendered::Notice(text) => println!("-- {text} --"),
    }
}
