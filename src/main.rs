use murmur::app::Command;
use tracing_subscriber::EnvFilter;

const HELP: &str = "Murmur - read your social feed from the terminal.

  --version, -V                  Show version and exit
  --help,    -h                  Show this help message
  --login <email> <password>     Sign in and remember the account
  --logout                       Sign the active account out
  --feed [pages]                 Print the feed, scrolling through [pages] pages
  --notifications                Print notifications
  --server <url>                 Save the API base url to the config file
  --demo                         Run against built-in sample data (offline)

Logging is controlled by MURMUR_LOG (e.g. MURMUR_LOG=debug).";

fn main() {
    init_tracing();

    let command = match parse_args(std::env::args().skip(1).collect()) {
        Ok(Some(command)) => command,
        Ok(None) => return,
        Err(message) => {
            eprintln!("error: {message}\n\n{HELP}");
            std::process::exit(2);
        }
    };

    if let Err(err) = murmur::run(command) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("MURMUR_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// `Ok(None)` means the flag was handled here and there is nothing to run.
fn parse_args(args: Vec<String>) -> Result<Option<Command>, String> {
    let mut args = args.into_iter();
    let Some(flag) = args.next() else {
        return Ok(Some(Command::Feed { pages: None }));
    };
    let command = match flag.as_str() {
        "--version" | "-V" => {
            println!("Murmur {}", murmur::VERSION);
            return Ok(None);
        }
        "--help" | "-h" => {
            println!("{HELP}");
            return Ok(None);
        }
        "--login" => {
            let email = args.next().ok_or("--login needs an email")?;
            let password = args.next().ok_or("--login needs a password")?;
            Command::Login { email, password }
        }
        "--logout" => Command::Logout,
        "--feed" => {
            let pages = match args.next() {
                Some(raw) => Some(
                    raw.parse::<u32>()
                        .ok()
                        .filter(|pages| *pages > 0)
                        .ok_or_else(|| format!("--feed expects a page count, got {raw:?}"))?,
                ),
                None => None,
            };
            Command::Feed { pages }
        }
        "--notifications" => Command::Notifications,
        "--server" => {
            let base_url = args.next().ok_or("--server needs a url")?;
            Command::Server { base_url }
        }
        "--demo" => Command::Demo,
        other => return Err(format!("unknown argument {other:?}")),
    };
    if let Some(extra) = args.next() {
        return Err(format!("unexpected argument {extra:?}"));
    }
    Ok(Some(command))
}
