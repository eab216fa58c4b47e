//! Integration tests for the session/world server.
//!
//! These drive the admission pipeline, the chunk streamer, the edit arbiter,
//! and the persistence path against the in-memory store, checking the
//! observable protocol behavior end to end.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use server::config::Config;
use server::edits;
use server::network::{flush_world, Ctx};
use server::registry::{self, AdmissionInfo, HandshakeOutcome, HelloArgs};
use server::session::apply_input;
use server::store::{MemStore, Store, WorldMeta};
use server::streamer;
use server::world::{ensure_section, WorldHandle, DEFAULT_WORLD_ID};
use shared::coords::SectionPos;
use shared::frames::{ErrorCode, RejectReason, ServerFrame, Vec3};
use shared::{
    decode_blocks, GENERATOR_VERSION, GRASS, PROTOCOL_VERSION, REGISTRY_VERSION, STONE,
};

fn test_config() -> Config {
    Config {
        bind_addr: "127.0.0.1:0".to_string(),
        allowed_origins: Vec::new(),
        database_url: None,
        service_key: None,
        public_url: "ws://127.0.0.1:8080".to_string(),
        region: "test".to_string(),
        display_name_auth: true,
    }
}

fn world_meta(id: &str) -> WorldMeta {
    WorldMeta {
        id: id.to_string(),
        name: id.to_string(),
        owner: None,
        is_public: true,
        max_players: 8,
        generator_version: GENERATOR_VERSION,
        registry_version: REGISTRY_VERSION,
    }
}

fn test_ctx() -> (Arc<Ctx>, Arc<MemStore>) {
    let store = Arc::new(MemStore::new());
    store.insert_world(world_meta("w1"));
    let ctx = Ctx::new(test_config(), store.clone());
    (ctx, store)
}

fn opaque_token(user_id: &str) -> String {
    let issued_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs();
    BASE64.encode(
        serde_json::json!({
            "display_name": user_id,
            "user_id": user_id,
            "issued_at": issued_at,
        })
        .to_string(),
    )
}

fn hello_for(user_id: &str, world_id: &str) -> HelloArgs {
    HelloArgs {
        protocol_version: PROTOCOL_VERSION,
        registry_version: REGISTRY_VERSION,
        generator_version: GENERATOR_VERSION,
        jwt: Some(opaque_token(user_id)),
        world_id: world_id.to_string(),
    }
}

/// Admits a player, panicking on anything but success.
async fn admit_player(
    ctx: &Arc<Ctx>,
    world_id: &str,
    user_id: &str,
) -> (AdmissionInfo, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    match registry::admit(ctx, hello_for(user_id, world_id), &tx).await {
        HandshakeOutcome::Admitted(info) => (info, rx),
        HandshakeOutcome::Rejected { code, message, .. } => {
            panic!("admission of {user_id} rejected: {code} ({message})")
        }
        HandshakeOutcome::Redirected { url } => panic!("unexpected redirect to {url}"),
    }
}

/// Drains every raw text frame currently queued on a connection.
fn drain_texts(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<String> {
    let mut texts = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let Message::Text(text) = message {
            texts.push(text);
        }
    }
    texts
}

fn drain_frames(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<ServerFrame> {
    drain_texts(rx)
        .iter()
        .map(|text| serde_json::from_str(text).expect("server sent unparseable frame"))
        .collect()
}

/// Moves a participant to an arbitrary position for reach-sensitive tests.
async fn place_participant(world: &Arc<WorldHandle>, player_id: &str, position: Vec3) {
    let mut data = world.state.lock().await;
    data.participants
        .get_mut(player_id)
        .expect("participant missing")
        .position = position;
}

/// ADMISSION TESTS
mod admission_tests {
    use super::*;

    #[tokio::test]
    async fn admission_into_empty_world() {
        let (ctx, store) = test_ctx();
        let (info, mut rx) = admit_player(&ctx, "w1", "alice").await;
        assert_eq!(info.player_id, "alice");

        let frames = drain_frames(&mut rx);
        assert_eq!(frames.len(), 1, "only the WELCOME should arrive");
        match &frames[0] {
            ServerFrame::Welcome {
                player_id,
                players,
                spawn_position,
                world_id,
                ..
            } => {
                assert_eq!(player_id, "alice");
                assert_eq!(world_id, "w1");
                assert!(players.is_empty());
                assert_eq!(spawn_position.y, 5.0);
            }
            other => panic!("expected WELCOME, got {other:?}"),
        }

        // Presence and session registration reached the store.
        assert_eq!(store.presence("w1", "alice").as_deref(), Some("alice"));
        let session = store.session("w1").expect("session row missing");
        assert_eq!(session.status, "online");
        assert_eq!(session.instance, ctx.instance_id);
    }

    #[tokio::test]
    async fn registry_version_mismatch_is_fatal() {
        let (ctx, _) = test_ctx();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut hello = hello_for("alice", "w1");
        hello.registry_version = 2;
        match registry::admit(&ctx, hello, &tx).await {
            HandshakeOutcome::Rejected { code, fatal, .. } => {
                assert_eq!(code, ErrorCode::RegistryMismatch);
                assert!(fatal);
            }
            _ => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn generator_version_mismatch_is_fatal() {
        let (ctx, _) = test_ctx();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut hello = hello_for("alice", "w1");
        hello.generator_version = 2;
        match registry::admit(&ctx, hello, &tx).await {
            HandshakeOutcome::Rejected { code, fatal, .. } => {
                assert_eq!(code, ErrorCode::GeneratorMismatch);
                assert!(fatal);
            }
            _ => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn missing_credential_fails_auth() {
        let (ctx, _) = test_ctx();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut hello = hello_for("alice", "w1");
        hello.jwt = None;
        match registry::admit(&ctx, hello, &tx).await {
            HandshakeOutcome::Rejected { code, fatal, .. } => {
                assert_eq!(code, ErrorCode::AuthFailed);
                assert!(fatal);
            }
            _ => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn unknown_world_is_rejected() {
        let (ctx, _) = test_ctx();
        let (tx, _rx) = mpsc::unbounded_channel();
        match registry::admit(&ctx, hello_for("alice", "nowhere"), &tx).await {
            HandshakeOutcome::Rejected { code, .. } => {
                assert_eq!(code, ErrorCode::WorldNotFound)
            }
            _ => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn banned_user_is_denied() {
        let (ctx, store) = test_ctx();
        store.add_ban("w1", "mallory", None);
        let (tx, _rx) = mpsc::unbounded_channel();
        match registry::admit(&ctx, hello_for("mallory", "w1"), &tx).await {
            HandshakeOutcome::Rejected { code, .. } => {
                assert_eq!(code, ErrorCode::PermissionDenied)
            }
            _ => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn private_world_requires_membership() {
        let (ctx, store) = test_ctx();
        let mut meta = world_meta("priv");
        meta.is_public = false;
        meta.owner = Some("owner".to_string());
        store.insert_world(meta);

        let (tx, _rx) = mpsc::unbounded_channel();
        match registry::admit(&ctx, hello_for("stranger", "priv"), &tx).await {
            HandshakeOutcome::Rejected { code, .. } => {
                assert_eq!(code, ErrorCode::PermissionDenied)
            }
            _ => panic!("expected rejection"),
        }

        // The owner and a member both get in.
        admit_player(&ctx, "priv", "owner").await;
        store.add_member("priv", "friend");
        admit_player(&ctx, "priv", "friend").await;
    }

    #[tokio::test]
    async fn ninth_participant_is_turned_away() {
        let (ctx, _) = test_ctx();
        let mut seats = Vec::new();
        for index in 0..8 {
            seats.push(admit_player(&ctx, "w1", &format!("user-{index}")).await);
        }

        let (tx, _rx) = mpsc::unbounded_channel();
        match registry::admit(&ctx, hello_for("user-8", "w1"), &tx).await {
            HandshakeOutcome::Rejected { code, fatal, .. } => {
                assert_eq!(code, ErrorCode::WorldFull);
                assert!(!fatal, "world_full is a capacity error, not fatal");
            }
            _ => panic!("expected rejection"),
        }

        // The cap is observable in the world state too.
        let world = ctx.registry.get("w1").await.expect("world active");
        assert_eq!(world.state.lock().await.participants.len(), 8);
    }

    #[tokio::test]
    async fn join_is_announced_to_the_others() {
        let (ctx, _) = test_ctx();
        let (_alice, mut alice_rx) = admit_player(&ctx, "w1", "alice").await;
        drain_frames(&mut alice_rx);

        let (_bob, mut bob_rx) = admit_player(&ctx, "w1", "bob").await;

        let alice_frames = drain_frames(&mut alice_rx);
        assert!(matches!(
            alice_frames.as_slice(),
            [ServerFrame::PlayerJoin { player, .. }] if player.player_id == "bob"
        ));

        // Bob's WELCOME lists Alice as already present.
        match &drain_frames(&mut bob_rx)[0] {
            ServerFrame::Welcome { players, .. } => {
                assert_eq!(players.len(), 1);
                assert_eq!(players[0].player_id, "alice");
            }
            other => panic!("expected WELCOME, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handshake_redirects_to_the_live_instance() {
        let (ctx, store) = test_ctx();
        store
            .register_session("w1", "other-instance", "ws://other.example:8080")
            .await
            .unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        match registry::admit(&ctx, hello_for("alice", "w1"), &tx).await {
            HandshakeOutcome::Redirected { url } => {
                assert_eq!(url, "ws://other.example:8080")
            }
            _ => panic!("expected redirect"),
        }
    }

    #[tokio::test]
    async fn default_world_bypasses_the_store() {
        let (ctx, store) = test_ctx();
        admit_player(&ctx, DEFAULT_WORLD_ID, "alice").await;
        assert!(store.session(DEFAULT_WORLD_ID).is_none());
        assert!(store.presence(DEFAULT_WORLD_ID, "alice").is_none());
    }
}

/// SUBSCRIPTION AND STREAMING TESTS
mod subscription_tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_streams_the_section() {
        let (ctx, _) = test_ctx();
        let (alice, mut rx) = admit_player(&ctx, "w1", "alice").await;
        drain_frames(&mut rx);

        streamer::handle_subscribe(
            &ctx,
            &alice.world,
            "alice",
            vec!["0:0:0".to_string()],
            Vec::new(),
        )
        .await;

        let frames = drain_frames(&mut rx);
        match frames.as_slice() {
            [ServerFrame::SectionData {
                section_id,
                version,
                blocks,
                baseline,
                ..
            }] => {
                assert_eq!(section_id, "0:0:0");
                assert_eq!(*version, 0);
                assert!(*baseline);
                let decoded = decode_blocks(blocks).unwrap();
                assert_eq!(decoded.len(), 4096);
                // Flat world: stone at local y 0, grass at local y 4.
                assert_eq!(decoded[0], STONE);
                assert_eq!(decoded[4 * 256], GRASS);
            }
            other => panic!("expected one SECTION_DATA, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_section_id_stops_the_message() {
        let (ctx, _) = test_ctx();
        let (alice, mut rx) = admit_player(&ctx, "w1", "alice").await;
        drain_frames(&mut rx);

        streamer::handle_subscribe(
            &ctx,
            &alice.world,
            "alice",
            vec![
                "0:0:0".to_string(),
                "not-a-section".to_string(),
                "1:0:0".to_string(),
            ],
            Vec::new(),
        )
        .await;

        // The valid prefix is kept; the rest of the message is dropped.
        let data = alice.world.state.lock().await;
        let subscribed = &data.participants["alice"].subscribed;
        assert!(subscribed.contains(&"0:0:0".parse::<SectionPos>().unwrap()));
        assert!(!subscribed.contains(&"1:0:0".parse::<SectionPos>().unwrap()));
        drop(data);

        let frames = drain_frames(&mut rx);
        assert!(frames.iter().any(|frame| matches!(
            frame,
            ServerFrame::Error {
                code: ErrorCode::InvalidRequest,
                fatal: false,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn subscribe_rate_keeps_the_processed_prefix() {
        let (ctx, _) = test_ctx();
        let (alice, mut rx) = admit_player(&ctx, "w1", "alice").await;
        drain_frames(&mut rx);

        // 101 distinct sections in one message: 100 pass, then rate overflow.
        let ids: Vec<String> = (0..101).map(|i| format!("{}:{}:0", i % 256, i / 256)).collect();
        streamer::handle_subscribe(&ctx, &alice.world, "alice", ids, Vec::new()).await;

        let data = alice.world.state.lock().await;
        assert_eq!(data.participants["alice"].subscribed.len(), 100);
        drop(data);

        let frames = drain_frames(&mut rx);
        assert!(frames.iter().any(|frame| matches!(
            frame,
            ServerFrame::Error {
                code: ErrorCode::RateLimited,
                fatal: false,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn subscription_cap_is_enforced() {
        let (ctx, _) = test_ctx();
        let (alice, mut rx) = admit_player(&ctx, "w1", "alice").await;
        drain_frames(&mut rx);

        // Fill the subscription set to the cap directly.
        {
            let mut data = alice.world.state.lock().await;
            for i in 0..128 {
                let pos = SectionPos::new(i % 256, i / 256, 0).unwrap();
                data.subscribe("alice", pos);
            }
            // Drop the queued deliveries; this test is about the cap.
            data.participants.get_mut("alice").unwrap().pending_sections.clear();
        }
        drain_texts(&mut rx);

        streamer::handle_subscribe(
            &ctx,
            &alice.world,
            "alice",
            vec!["200:200:0".to_string()],
            Vec::new(),
        )
        .await;

        let data = alice.world.state.lock().await;
        assert_eq!(data.participants["alice"].subscribed.len(), 128);
        drop(data);
        let frames = drain_frames(&mut rx);
        assert!(frames.iter().any(|frame| matches!(
            frame,
            ServerFrame::Error {
                code: ErrorCode::RateLimited,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn unsubscribe_and_disconnect_clean_the_index() {
        let (ctx, _) = test_ctx();
        let (alice, mut alice_rx) = admit_player(&ctx, "w1", "alice").await;
        let (_bob, mut bob_rx) = admit_player(&ctx, "w1", "bob").await;
        let pos: SectionPos = "0:0:0".parse().unwrap();

        streamer::handle_subscribe(&ctx, &alice.world, "alice", vec![pos.to_string()], Vec::new())
            .await;
        streamer::handle_subscribe(&ctx, &alice.world, "bob", vec![pos.to_string()], Vec::new())
            .await;
        drain_texts(&mut alice_rx);
        drain_texts(&mut bob_rx);

        // Alice unsubscribes explicitly.
        streamer::handle_subscribe(&ctx, &alice.world, "alice", Vec::new(), vec![pos.to_string()])
            .await;
        {
            let data = alice.world.state.lock().await;
            assert!(!data.subscribers[&pos].contains("alice"));
            assert!(data.subscribers[&pos].contains("bob"));
        }

        // Bob disconnects; the index entry disappears with him.
        registry::depart(&ctx, &alice.world, "bob").await;
        let data = alice.world.state.lock().await;
        assert!(data.subscribers.get(&pos).is_none());
        drop(data);

        let frames = drain_frames(&mut alice_rx);
        assert!(frames.iter().any(|frame| matches!(
            frame,
            ServerFrame::PlayerLeave { player_id, .. } if player_id == "bob"
        )));
    }
}

/// EDIT ARBITER TESTS
mod edit_tests {
    use super::*;

    /// Admits two players near the origin, both subscribed to "0:0:0".
    async fn edit_fixture(
        ctx: &Arc<Ctx>,
    ) -> (
        AdmissionInfo,
        mpsc::UnboundedReceiver<Message>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (alice, mut alice_rx) = admit_player(ctx, "w1", "alice").await;
        let (_bob, mut bob_rx) = admit_player(ctx, "w1", "bob").await;
        place_participant(&alice.world, "alice", Vec3::new(2.5, 5.0, 2.5)).await;
        place_participant(&alice.world, "bob", Vec3::new(4.5, 5.0, 4.5)).await;
        for player in ["alice", "bob"] {
            streamer::handle_subscribe(
                ctx,
                &alice.world,
                player,
                vec!["0:0:0".to_string()],
                Vec::new(),
            )
            .await;
        }
        drain_texts(&mut alice_rx);
        drain_texts(&mut bob_rx);
        (alice, alice_rx, bob_rx)
    }

    #[tokio::test]
    async fn accepted_edit_reaches_every_subscriber() {
        let (ctx, _) = test_ctx();
        let (alice, mut alice_rx, mut bob_rx) = edit_fixture(&ctx).await;

        edits::handle_edit(&ctx, &alice.world, "alice", "r1".to_string(), 0, 5, 0, 1).await;

        for rx in [&mut alice_rx, &mut bob_rx] {
            let frames = drain_frames(rx);
            match frames.as_slice() {
                [ServerFrame::BlockEvent {
                    request_id,
                    accepted,
                    previous_block_id,
                    section_version,
                    ..
                }] => {
                    assert_eq!(request_id, "r1");
                    assert!(*accepted);
                    assert_eq!(*previous_block_id, Some(0));
                    assert_eq!(*section_version, Some(1));
                }
                other => panic!("expected one BLOCK_EVENT, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn duplicate_request_replays_identical_bytes() {
        let (ctx, _) = test_ctx();
        let (alice, mut alice_rx, mut bob_rx) = edit_fixture(&ctx).await;

        edits::handle_edit(&ctx, &alice.world, "alice", "r1".to_string(), 0, 5, 0, 1).await;
        let first = drain_texts(&mut alice_rx);
        drain_texts(&mut bob_rx);

        edits::handle_edit(&ctx, &alice.world, "alice", "r1".to_string(), 0, 5, 0, 1).await;
        let replay = drain_texts(&mut alice_rx);

        assert_eq!(first, replay, "replay must be byte-equal");
        assert!(
            drain_texts(&mut bob_rx).is_empty(),
            "a replay must not re-broadcast"
        );

        // The section version did not move.
        let data = alice.world.state.lock().await;
        let pos: SectionPos = "0:0:0".parse().unwrap();
        assert_eq!(data.sections[&pos].version, 1);
    }

    #[tokio::test]
    async fn out_of_reach_edit_is_rejected_quietly() {
        let (ctx, _) = test_ctx();
        let (alice, mut alice_rx, mut bob_rx) = edit_fixture(&ctx).await;
        place_participant(&alice.world, "alice", Vec3::new(0.5, 5.0, 0.5)).await;

        edits::handle_edit(
            &ctx,
            &alice.world,
            "alice",
            "far".to_string(),
            100,
            5,
            100,
            1,
        )
        .await;

        let frames = drain_frames(&mut alice_rx);
        match frames.as_slice() {
            [ServerFrame::BlockEvent {
                accepted,
                reject_reason,
                ..
            }] => {
                assert!(!*accepted);
                assert_eq!(*reject_reason, Some(RejectReason::TooFar));
            }
            other => panic!("expected one rejection, got {other:?}"),
        }
        assert!(
            drain_texts(&mut bob_rx).is_empty(),
            "rejections reach only the requester"
        );
    }

    #[tokio::test]
    async fn placement_and_destruction_rules() {
        let (ctx, _) = test_ctx();
        let (alice, mut alice_rx, _bob_rx) = edit_fixture(&ctx).await;

        let expect_reason = |frames: Vec<ServerFrame>, expected: RejectReason| match frames
            .as_slice()
        {
            [ServerFrame::BlockEvent {
                accepted,
                reject_reason,
                ..
            }] => {
                assert!(!*accepted);
                assert_eq!(*reject_reason, Some(expected));
            }
            other => panic!("expected one rejection, got {other:?}"),
        };

        // Breaking air breaks nothing.
        edits::handle_edit(&ctx, &alice.world, "alice", "e1".to_string(), 1, 6, 1, 0).await;
        expect_reason(drain_frames(&mut alice_rx), RejectReason::NothingToBreak);

        // Placing into stone is occupied.
        edits::handle_edit(&ctx, &alice.world, "alice", "e2".to_string(), 2, 2, 2, 1).await;
        expect_reason(drain_frames(&mut alice_rx), RejectReason::BlockOccupied);

        // Placing into your own body is refused.
        edits::handle_edit(&ctx, &alice.world, "alice", "e3".to_string(), 2, 5, 2, 1).await;
        expect_reason(drain_frames(&mut alice_rx), RejectReason::CannotPlaceInsideSelf);

        // Out-of-bounds coordinates never reach a section.
        edits::handle_edit(&ctx, &alice.world, "alice", "e4".to_string(), -1, 5, 0, 1).await;
        expect_reason(drain_frames(&mut alice_rx), RejectReason::OutOfBounds);
        edits::handle_edit(&ctx, &alice.world, "alice", "e5".to_string(), 0, 300, 0, 1).await;
        expect_reason(drain_frames(&mut alice_rx), RejectReason::OutOfBounds);
    }

    #[tokio::test]
    async fn edit_rate_limit_rejects_the_twenty_first() {
        let (ctx, _) = test_ctx();
        let (alice, mut alice_rx, _bob_rx) = edit_fixture(&ctx).await;
        place_participant(&alice.world, "alice", Vec3::new(8.5, 5.0, 8.5)).await;

        // 20 distinct placements inside reach, above head height.
        let mut accepted = 0;
        for i in 0..20 {
            let (x, z) = (6 + i % 5, 6 + i / 5);
            edits::handle_edit(
                &ctx,
                &alice.world,
                "alice",
                format!("burst-{i}"),
                x,
                7,
                z,
                1,
            )
            .await;
            accepted += 1;
        }
        assert_eq!(accepted, 20);
        drain_texts(&mut alice_rx);

        edits::handle_edit(
            &ctx,
            &alice.world,
            "alice",
            "burst-20".to_string(),
            10,
            7,
            10,
            1,
        )
        .await;
        let frames = drain_frames(&mut alice_rx);
        match frames.as_slice() {
            [ServerFrame::BlockEvent {
                accepted,
                reject_reason,
                ..
            }] => {
                assert!(!*accepted);
                assert_eq!(*reject_reason, Some(RejectReason::RateLimited));
            }
            other => panic!("expected one rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn section_versions_increase_by_one_per_edit() {
        let (ctx, _) = test_ctx();
        let (alice, mut alice_rx, _bob_rx) = edit_fixture(&ctx).await;

        edits::handle_edit(&ctx, &alice.world, "alice", "p1".to_string(), 1, 5, 1, 1).await;
        edits::handle_edit(&ctx, &alice.world, "alice", "p2".to_string(), 1, 5, 1, 0).await;

        let versions: Vec<i64> = drain_frames(&mut alice_rx)
            .into_iter()
            .filter_map(|frame| match frame {
                ServerFrame::BlockEvent {
                    accepted: true,
                    section_version,
                    ..
                } => section_version,
                _ => None,
            })
            .collect();
        assert_eq!(versions, vec![1, 2]);

        // The break reported the placed block as previous.
        let pos: SectionPos = "0:0:0".parse().unwrap();
        let data = alice.world.state.lock().await;
        assert_eq!(data.sections[&pos].version, 2);
        assert!(data.sections[&pos].dirty);
    }
}

/// MOTION AND RESYNC TESTS
mod input_tests {
    use super::*;

    #[tokio::test]
    async fn input_updates_motion_with_clamping() {
        let (ctx, _) = test_ctx();
        let (alice, mut rx) = admit_player(&ctx, "w1", "alice").await;
        drain_texts(&mut rx);

        apply_input(
            &alice,
            1,
            Vec3::new(-10.0, 5000.0, 17.5),
            Vec3::new(1.0, 0.0, 0.0),
            45.0,
            -10.0,
        )
        .await;

        let data = alice.world.state.lock().await;
        let participant = &data.participants["alice"];
        assert_eq!(participant.position.x, 0.0);
        assert_eq!(participant.position.y, 128.0);
        assert_eq!(participant.position.z, 17.5);
        assert_eq!(participant.last_input_sequence, 1);
        assert_eq!(participant.yaw, 45.0);
    }

    #[tokio::test]
    async fn stale_inputs_are_ignored() {
        let (ctx, _) = test_ctx();
        let (alice, mut rx) = admit_player(&ctx, "w1", "alice").await;
        drain_texts(&mut rx);

        apply_input(&alice, 10, Vec3::new(5.0, 5.0, 5.0), Vec3::zero(), 0.0, 0.0).await;
        apply_input(&alice, 9, Vec3::new(9.0, 5.0, 9.0), Vec3::zero(), 0.0, 0.0).await;

        let data = alice.world.state.lock().await;
        let participant = &data.participants["alice"];
        assert_eq!(participant.position.x, 5.0);
        assert_eq!(participant.last_input_sequence, 10);
        drop(data);
        assert!(drain_texts(&mut rx).is_empty(), "no RESYNC for a small gap");
    }

    #[tokio::test]
    async fn sequence_regression_triggers_resync() {
        let (ctx, _) = test_ctx();
        let (alice, mut rx) = admit_player(&ctx, "w1", "alice").await;
        drain_texts(&mut rx);

        apply_input(&alice, 500, Vec3::new(5.0, 5.0, 5.0), Vec3::zero(), 0.0, 0.0).await;
        // The client restarted its stream from 1.
        apply_input(&alice, 1, Vec3::new(9.0, 5.0, 9.0), Vec3::zero(), 0.0, 0.0).await;

        let frames = drain_frames(&mut rx);
        match frames.as_slice() {
            [ServerFrame::Resync {
                position,
                last_input_sequence,
                ..
            }] => {
                assert_eq!(position.x, 5.0);
                assert_eq!(*last_input_sequence, 500);
            }
            other => panic!("expected one RESYNC, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn snapshot_carries_every_participant() {
        let (ctx, _) = test_ctx();
        let (alice, _alice_rx) = admit_player(&ctx, "w1", "alice").await;
        let (_bob, _bob_rx) = admit_player(&ctx, "w1", "bob").await;
        apply_input(&alice, 3, Vec3::new(7.0, 5.0, 7.0), Vec3::zero(), 0.0, 0.0).await;

        let data = alice.world.state.lock().await;
        match data.snapshot(1234) {
            ServerFrame::Snapshot {
                timestamp, players, ..
            } => {
                assert_eq!(timestamp, 1234);
                assert_eq!(players.len(), 2);
                let alice_state = players
                    .iter()
                    .find(|player| player.player_id == "alice")
                    .unwrap();
                assert_eq!(alice_state.last_input_sequence, 3);
                assert_eq!(alice_state.position.x, 7.0);
            }
            other => panic!("expected SNAPSHOT, got {other:?}"),
        }
    }
}

/// PERSISTENCE AND RECOVERY TESTS
mod persistence_tests {
    use super::*;

    #[tokio::test]
    async fn flush_persists_and_clears_dirty_flags() {
        let (ctx, store) = test_ctx();
        let (alice, mut rx) = admit_player(&ctx, "w1", "alice").await;
        place_participant(&alice.world, "alice", Vec3::new(2.5, 5.0, 2.5)).await;
        edits::handle_edit(&ctx, &alice.world, "alice", "r1".to_string(), 0, 5, 0, 1).await;
        drain_texts(&mut rx);

        flush_world(&ctx, &alice.world).await;

        let row = store.section("w1", "0:0:0").expect("section persisted");
        assert_eq!(row.version, 1);
        assert_eq!(row.blocks.len(), 8192);
        assert_eq!(alice.world.state.lock().await.dirty_count(), 0);
    }

    #[tokio::test]
    async fn persisted_section_reloads_as_written() {
        let (ctx, store) = test_ctx();
        let (alice, _rx) = admit_player(&ctx, "w1", "alice").await;
        place_participant(&alice.world, "alice", Vec3::new(2.5, 5.0, 2.5)).await;
        edits::handle_edit(&ctx, &alice.world, "alice", "r1".to_string(), 0, 5, 0, 1).await;
        flush_world(&ctx, &alice.world).await;

        let written = {
            let data = alice.world.state.lock().await;
            let pos: SectionPos = "0:0:0".parse().unwrap();
            (data.sections[&pos].version, data.sections[&pos].blocks.clone())
        };

        // A fresh process materializes the world again from the store.
        let fresh = WorldHandle::new(world_meta("w1"));
        let pos: SectionPos = "0:0:0".parse().unwrap();
        ensure_section(store.as_ref(), &fresh, pos).await.unwrap();
        let data = fresh.state.lock().await;
        assert_eq!(data.sections[&pos].version, written.0);
        assert_eq!(data.sections[&pos].blocks, written.1);
        assert!(data.sections[&pos].from_store);
        assert!(data.sections[&pos].version >= 1);
    }

    #[tokio::test]
    async fn default_world_is_never_flushed() {
        let (ctx, store) = test_ctx();
        let (alice, _rx) = admit_player(&ctx, DEFAULT_WORLD_ID, "alice").await;
        place_participant(&alice.world, "alice", Vec3::new(2.5, 5.0, 2.5)).await;
        edits::handle_edit(&ctx, &alice.world, "alice", "r1".to_string(), 0, 5, 0, 1).await;

        flush_world(&ctx, &alice.world).await;
        assert!(store.section(DEFAULT_WORLD_ID, "0:0:0").is_none());
        // The edit itself stands in memory.
        assert_eq!(alice.world.state.lock().await.dirty_count(), 1);
    }

    #[tokio::test]
    async fn last_departure_flushes_and_evicts_the_world() {
        let (ctx, store) = test_ctx();
        let (alice, _rx) = admit_player(&ctx, "w1", "alice").await;
        place_participant(&alice.world, "alice", Vec3::new(2.5, 5.0, 2.5)).await;
        edits::handle_edit(&ctx, &alice.world, "alice", "r1".to_string(), 0, 5, 0, 1).await;

        registry::depart(&ctx, &alice.world, "alice").await;

        assert!(store.section("w1", "0:0:0").is_some());
        assert!(
            ctx.registry.get("w1").await.is_none(),
            "an empty, clean world is evicted"
        );
    }

    #[tokio::test]
    async fn instance_restart_clears_orphaned_sessions() {
        let (ctx, store) = test_ctx();
        admit_player(&ctx, "w1", "alice").await;
        assert_eq!(store.session("w1").unwrap().status, "online");

        // What run() does first on startup with the same instance id.
        store.mark_sessions_offline(&ctx.instance_id).await.unwrap();
        assert_eq!(store.session("w1").unwrap().status, "offline");
    }
}
