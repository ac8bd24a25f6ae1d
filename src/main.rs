use std::env;

use gymdesk::app::{self, AppState};
use gymdesk::config::Config;
use gymdesk::login::create_instructor;
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let config = Config::load()?;

    match args.first().map(String::as_str) {
        None | Some("serve") => app::run(config).await?,
        Some("add-instructor") => {
            let (Some(username), Some(password)) = (args.get(1), args.get(2)) else {
                eprintln!("usage: gymdesk add-instructor <username> <password> [name...]");
                std::process::exit(2);
            };
            let name = match args[3..].join(" ") {
                name if name.trim().is_empty() => username.clone(),
                name => name,
            };

            let state = AppState::from_config(config).await?;
            let user = create_instructor(state.backend.as_ref(), username, password, &name).await?;
            info!("Created instructor {} ({})", user.username, user.id);
        }
        Some(other) => {
            eprintln!("unknown command `{other}`; expected `serve` or `add-instructor`");
            std::process::exit(2);
        }
    }

    Ok(())
}
