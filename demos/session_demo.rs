//! Session example
//!
//! Usage:
//!   CHRONOS_API_URL=http://localhost:8000 CHRONOS_EMAIL=... CHRONOS_PASSWORD=... \
//!     cargo run --example session_demo [photo.jpg]

use chronos_client::{ApiClient, ClientConfig, Coordinates, FileTokenStorage, Photo, Session};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ClientConfig::from_env()?;
    let storage = FileTokenStorage::default_location()?;
    println!("=== Chronos Client Example ===");
    println!("API:    {}", config.base_url);
    println!("Tokens: {}", storage.path().display());
    println!();

    let client = ApiClient::new(config, storage)?;
    let session = Session::new(client.clone());

    let user = match session.restore().await {
        Some(user) => user,
        None => {
            let email = std::env::var("CHRONOS_EMAIL")?;
            let password = std::env::var("CHRONOS_PASSWORD")?;
            session
                .login(&email, &password)
                .await?
                .ok_or("login response carried no user")?
        }
    };
    println!("✓ Signed in as {} <{}>", user.name, user.email);

    // Check in with the given photo, or check out if the last shift is still open
    if let Some(photo_path) = std::env::args().nth(1) {
        let photo = Photo::from_path(&photo_path).await?;
        let position = Coordinates::new(-23.5505, -46.6333);
        let open_shift = client.time_logs().await?.iter().any(|log| log.check_out.is_none());

        let response = if open_shift {
            client.check_out(photo, position).await?
        } else {
            client.check_in(photo, position).await?
        };
        println!("✓ {}", response.message);
    }

    // Several requests at once share a single token refresh if the access token expired
    let (logs, profile) = tokio::join!(client.time_logs(), client.profile());
    let logs = logs?;
    println!("✓ Profile: {}", profile?.user.name);
    println!("Time logs ({}):", logs.len());
    for log in logs.iter().take(10) {
        println!(
            "  - {} -> {}  photo: {}",
            log.check_in,
            log.check_out.as_deref().unwrap_or("open"),
            client.photo_url(Some(log.check_in_photo.as_str())).unwrap_or_default()
        );
    }

    Ok(())
}
