use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use shared::coords::{sections_in_radius, world_to_section};
use shared::frames::{ClientFrame, ServerFrame, Vec3, INPUT_FORWARD};
use shared::{GENERATOR_VERSION, PROTOCOL_VERSION, REGISTRY_VERSION};

/// Manual smoke-test client: handshake, subscribe, move, place one block.
///
/// The server must be running with --display-name-auth for the generated
/// opaque token to be accepted.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// WebSocket endpoint of the server
    #[clap(long, default_value = "ws://127.0.0.1:8080")]
    url: String,

    /// World to join
    #[clap(long, default_value = "default-world")]
    world: String,

    /// Display name carried in the dev token
    #[clap(long, default_value = "tester")]
    name: String,
}

// Get current timestamp in seconds
fn get_timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let (ws, _) = connect_async(args.url.as_str()).await?;
    println!("Connected to {}", args.url);
    let (mut write, mut read) = ws.split();

    // Opaque dev token
    let user_id = format!("dev-{:08x}", rand::thread_rng().gen::<u32>());
    let token = BASE64.encode(
        serde_json::json!({
            "display_name": args.name,
            "user_id": user_id,
            "issued_at": get_timestamp_secs(),
        })
        .to_string(),
    );

    let hello = ClientFrame::Hello {
        protocol_version: PROTOCOL_VERSION,
        registry_version: REGISTRY_VERSION,
        generator_version: GENERATOR_VERSION,
        jwt: Some(token),
        world_id: args.world.clone(),
    };
    write.send(Message::Text(serde_json::to_string(&hello)?)).await?;
    println!("Sent HELLO as {user_id} for world {}", args.world);

    // Wait for the WELCOME
    let mut position = Vec3::zero();
    while let Some(msg) = read.next().await {
        let msg = msg?;
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(frame) => {
                println!("Connection closed during handshake: {frame:?}");
                return Ok(());
            }
            _ => continue,
        };
        match serde_json::from_str::<ServerFrame>(&text)? {
            ServerFrame::Welcome {
                player_id,
                spawn_position,
                players,
                ..
            } => {
                println!(
                    "WELCOME: player {player_id} spawns at ({:.1}, {:.1}, {:.1}), {} already present",
                    spawn_position.x,
                    spawn_position.y,
                    spawn_position.z,
                    players.len()
                );
                position = spawn_position;
                break;
            }
            ServerFrame::Redirect { url, .. } => {
                println!("REDIRECT to {url}");
                return Ok(());
            }
            ServerFrame::Error {
                code,
                message,
                fatal,
                ..
            } => {
                println!("ERROR {code}: {message} (fatal: {fatal})");
                if fatal {
                    return Ok(());
                }
            }
            other => println!("Unexpected frame before WELCOME: {other:?}"),
        }
    }

    // Subscribe to the spawn column and its neighbors
    if let Some(center) = world_to_section(position.x as i32, position.y as i32, position.z as i32)
    {
        let ids: Vec<String> = sections_in_radius(center, 1)
            .iter()
            .map(|pos| pos.to_string())
            .collect();
        println!("Subscribing to {} sections around {center}", ids.len());
        let frame = ClientFrame::Subscribe {
            protocol_version: PROTOCOL_VERSION,
            subscribe: ids,
            unsubscribe: Vec::new(),
        };
        write.send(Message::Text(serde_json::to_string(&frame)?)).await?;
    }

    // Walk forward for a couple of seconds, printing what comes back
    let mut sequence = 1u32;
    let mut snapshots = 0usize;
    let mut sections = 0usize;
    for _ in 0..10 {
        position.x += 0.2;
        let input = ClientFrame::Input {
            protocol_version: PROTOCOL_VERSION,
            sequence,
            position,
            velocity: Vec3::new(1.0, 0.0, 0.0),
            yaw: 90.0,
            pitch: 0.0,
            inputs: INPUT_FORWARD,
        };
        sequence += 1;
        write.send(Message::Text(serde_json::to_string(&input)?)).await?;

        // Drain whatever the server pushed since the last input
        while let Ok(Some(Ok(Message::Text(text)))) =
            timeout(Duration::from_millis(50), read.next()).await
        {
            match serde_json::from_str::<ServerFrame>(&text)? {
                ServerFrame::Snapshot { players, .. } => {
                    snapshots += 1;
                    if snapshots == 1 {
                        println!("First SNAPSHOT: {} players", players.len());
                    }
                }
                ServerFrame::SectionData {
                    section_id,
                    version,
                    baseline,
                    ..
                } => {
                    sections += 1;
                    if sections <= 3 {
                        println!("SECTION_DATA {section_id} v{version} (baseline: {baseline})");
                    }
                }
                other => println!("Frame: {other:?}"),
            }
        }
        sleep(Duration::from_millis(150)).await;
    }
    println!("Received {snapshots} snapshots and {sections} sections");

    // Place one block two cells ahead
    let edit = ClientFrame::BlockEditRequest {
        protocol_version: PROTOCOL_VERSION,
        request_id: format!("probe-{user_id}"),
        x: position.x as i32 + 2,
        y: 5,
        z: position.z as i32,
        block_id: 1,
    };
    write.send(Message::Text(serde_json::to_string(&edit)?)).await?;
    println!("Sent BLOCK_EDIT_REQUEST");

    let deadline = Duration::from_secs(2);
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        match timeout(Duration::from_millis(200), read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                if let ServerFrame::BlockEvent {
                    accepted,
                    section_version,
                    previous_block_id,
                    reject_reason,
                    ..
                } = serde_json::from_str::<ServerFrame>(&text)?
                {
                    if accepted {
                        println!(
                            "Edit accepted: section v{:?}, previous block {:?}",
                            section_version, previous_block_id
                        );
                    } else {
                        println!("Edit rejected: {:?}", reject_reason);
                    }
                    break;
                }
            }
            Ok(Some(_)) | Err(_) => continue,
            Ok(None) => break,
        }
    }

    write.send(Message::Close(None)).await?;
    println!("Test client finished");
    Ok(())
}
