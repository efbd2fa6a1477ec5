//! Socket-level integration tests for client ↔ server sessions.

use arena_client::{launch, ClientEvent, SessionClient};
use arena_server::SessionEvent;
use arena_shared::{
    config::{ProjectileConfig, SessionConfig},
    math::Vec3,
    net::{decode_from_bytes, encode_to_bytes, ClientId, FieldUpdate, NetMsg, Phase, PlayerField, SessionInfo},
    relay::{LoopbackRelay, NetworkMode},
    rpc::{procedures, RpcArgs, RpcCall},
};
use arena_tests::{init_tracing, local_config, reach_gameplay, wait_for_player, RunningServer, WAIT};

/// Handshake payload carries the session facts intact.
#[test]
fn welcome_survives_encoding() -> anyhow::Result<()> {
    let welcome = NetMsg::Welcome {
        client_id: ClientId(3),
        session: SessionInfo {
            join_code: None,
            phase: Phase::AwaitingSceneLoad,
            started_at: chrono::Utc::now(),
        },
    };
    assert_eq!(decode_from_bytes(&encode_to_bytes(&welcome)?)?, welcome);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_players_reach_gameplay() -> anyhow::Result<()> {
    init_tracing();
    let mut server = RunningServer::start(local_config()).await?;
    let mut clients = server.connect_all(2).await?;
    assert_eq!(clients[0].client_id(), ClientId(0));
    assert_eq!(clients[1].client_id(), ClientId(1));

    reach_gameplay(&mut clients).await?;

    for client in &clients {
        assert_eq!(client.phase(), Phase::Gameplay);
        assert!(client.mirror().players().all(|p| !p.is_ready));
        assert!(client.my_avatar().is_some());
    }

    let mut transitions = 0;
    while let Ok(event) = server.events.try_recv() {
        if matches!(&event, SessionEvent::Broadcast { procedure, .. } if procedure == procedures::SCENE_TRANSITION) {
            transitions += 1;
        }
    }
    assert_eq!(transitions, 1);

    server.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn projectile_hits_other_player() -> anyhow::Result<()> {
    init_tracing();
    let cfg = SessionConfig {
        projectile: ProjectileConfig {
            speed: 40.0,
            ..Default::default()
        },
        ..local_config()
    };
    let server = RunningServer::start(cfg).await?;
    let mut clients = server.connect_all(2).await?;
    reach_gameplay(&mut clients).await?;

    // Default spawn points face each other along x.
    clients[0].shoot_from_avatar(Vec3::new(1.0, 0.0, 0.0)).await?;

    let victim = ClientId(1);
    for client in clients.iter_mut() {
        client
            .wait_for(WAIT, |e| matches!(e, ClientEvent::Impact { .. }))
            .await?;
        client
            .wait_for(WAIT, |e| {
                *e == ClientEvent::FieldChanged(FieldUpdate {
                    client_id: victim,
                    field: PlayerField::Health(90),
                })
            })
            .await?;
    }
    assert_eq!(clients[0].mirror().player(victim).map(|p| p.health), Some(90));
    assert_eq!(clients[0].me().map(|p| p.health), Some(100));

    server.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_cannot_forge_broadcasts() -> anyhow::Result<()> {
    init_tracing();
    let server = RunningServer::start(local_config()).await?;
    let mut clients = server.connect_all(2).await?;
    wait_for_player(&mut clients[1], ClientId(1)).await?;

    clients[0]
        .call(RpcCall::new(procedures::START_GAMEPLAY, RpcArgs::None))
        .await?;
    // Processed in order after the forged call.
    clients[0].set_appearance(2).await?;

    clients[1]
        .wait_for(WAIT, |e| {
            *e == ClientEvent::FieldChanged(FieldUpdate {
                client_id: ClientId(0),
                field: PlayerField::Appearance(2),
            })
        })
        .await?;
    let events = clients[1].drain_events();
    assert!(!events.contains(&ClientEvent::StartGameplay));
    assert_eq!(clients[1].phase(), Phase::Lobby);

    server.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leaving_player_does_not_advance_lobby() -> anyhow::Result<()> {
    init_tracing();
    let server = RunningServer::start(local_config()).await?;
    let mut clients = server.connect_all(2).await?;
    wait_for_player(&mut clients[0], ClientId(1)).await?;

    clients[0].ready_up().await?;
    clients[0]
        .wait_for(WAIT, |e| {
            *e == ClientEvent::FieldChanged(FieldUpdate {
                client_id: ClientId(0),
                field: PlayerField::IsReady(true),
            })
        })
        .await?;

    let mut leaver = clients.pop().expect("two clients");
    leaver.disconnect().await?;
    clients[0]
        .wait_for(WAIT, |e| *e == ClientEvent::PlayerLeft(ClientId(1)))
        .await?;

    clients[0].poll(std::time::Duration::from_millis(100)).await?;
    assert!(!clients[0].drain_events().contains(&ClientEvent::SceneTransition));
    assert_eq!(clients[0].phase(), Phase::Lobby);
    assert_eq!(clients[0].mirror().players().count(), 1);

    server.stop().await
}

#[tokio::test]
async fn full_session_refuses_connection() -> anyhow::Result<()> {
    init_tracing();
    let cfg = SessionConfig {
        max_players: 1,
        ..local_config()
    };
    let server = RunningServer::start(cfg).await?;
    let _first = server.connect_all(1).await?;

    let refused = SessionClient::connect(server.addr).await;
    assert!(refused.is_err());

    server.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relay_client_joins_by_code() -> anyhow::Result<()> {
    init_tracing();
    let relay = LoopbackRelay::new();

    let hosted = launch(NetworkMode::RelayHost, local_config(), &relay, None).await?;
    let mut host_client = hosted.client;
    let host = hosted.host.expect("relay host runs a session");
    let code = host.join_code.clone().expect("relay host has a join code");
    assert_eq!(host_client.session().join_code.as_ref(), Some(&code));

    let joined = launch(NetworkMode::RelayClient, local_config(), &relay, Some(&code)).await?;
    assert!(joined.host.is_none());
    assert_eq!(joined.client.client_id(), ClientId(1));

    wait_for_player(&mut host_client, ClientId(1)).await?;
    host.stop().await
}
