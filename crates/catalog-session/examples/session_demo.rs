//! Session authority demonstration
//!
//! Three contexts share one in-memory medium. One becomes the session
//! authority, hands over gracefully when it closes, and the next leader is
//! replaced through the stale timeout after it is killed.

use catalog_session::{
    store::MemoryMedium, LeadershipEvent, SessionAuthority, SessionConfig, SystemClock,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn demo_config() -> SessionConfig {
    SessionConfig {
        stale_timeout: Duration::from_millis(1500),
        heartbeat_interval: Duration::from_millis(1000),
        claim_window: Duration::from_millis(100),
        ..SessionConfig::default()
    }
}

async fn open_context(
    medium: &MemoryMedium,
    name: &'static str,
) -> Result<SessionAuthority, Box<dyn std::error::Error>> {
    let authority = SessionAuthority::with_parts(
        Arc::new(medium.connect()),
        Arc::new(SystemClock),
        demo_config(),
    )?;

    authority.on_leadership_change(move |event| match event {
        LeadershipEvent::Acquired { .. } => println!("👑 {} is now the session authority", name),
        LeadershipEvent::Lost { .. } => println!("   {} stepped down", name),
    });
    authority.start().await?;
    Ok(authority)
}

async fn print_roles(contexts: &[(&str, &SessionAuthority)]) {
    for (name, authority) in contexts {
        println!("   {:<8} {}", name, authority.role().await);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("🚀 Starting Catalog Session Authority Demo");
    let medium = MemoryMedium::new();

    let library = open_context(&medium, "library").await?;
    sleep(Duration::from_millis(50)).await;
    let player = open_context(&medium, "player").await?;
    let search = open_context(&medium, "search").await?;

    sleep(Duration::from_millis(500)).await;
    println!("\n📋 Roles after startup:");
    print_roles(&[("library", &library), ("player", &player), ("search", &search)]).await;

    let result = library.guard(|| async { "refreshed session token" }).await;
    println!("\n🔐 library guarded call: {:?}", result);
    let result = player.guard(|| async { "refreshed session token" }).await;
    println!("🔐 player guarded call: {:?}", result.map_err(|e| e.to_string()));

    println!("\n👋 Closing library gracefully");
    library.shutdown().await;
    sleep(Duration::from_millis(1200)).await;
    print_roles(&[("player", &player), ("search", &search)]).await;

    let (next, survivor) = if player.is_leader() {
        (&player, &search)
    } else {
        (&search, &player)
    };

    println!("\n💥 Killing the current authority without releasing the lease");
    next.manager().abandon().await;
    sleep(Duration::from_millis(3000)).await;
    println!("   survivor is leader: {}", survivor.is_leader());

    survivor.shutdown().await;
    println!("\n✅ Demo finished");
    Ok(())
}
