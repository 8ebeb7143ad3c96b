use chatserver::realtime::events::ServerEvent;
use chatserver::realtime::{room, ConnId, Principal, Role, RoomRouter};
use tokio::sync::mpsc;
use uuid::Uuid;

type Rx = mpsc::UnboundedReceiver<ServerEvent>;

async fn connect_user(router: &RoomRouter, user_id: Uuid) -> (ConnId, Rx) {
    let conn = Uuid::new_v4();
    let (tx, rx) = mpsc::unbounded_channel();
    router
        .register(
            conn,
            Principal {
                role: Role::User,
                user_id: Some(user_id),
                agent_id: None,
            },
            tx,
        )
        .await;
    (conn, rx)
}

async fn connect_agent(router: &RoomRouter, agent_id: i32) -> (ConnId, Rx) {
    let conn = Uuid::new_v4();
    let (tx, rx) = mpsc::unbounded_channel();
    router
        .register(
            conn,
            Principal {
                role: Role::Agent,
                user_id: None,
                agent_id: Some(agent_id),
            },
            tx,
        )
        .await;
    (conn, rx)
}

fn drain(rx: &mut Rx) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn broadcast_reaches_every_room_member_and_nobody_else() {
    let router = RoomRouter::new();
    let user = Uuid::new_v4();
    let (user_conn, mut user_rx) = connect_user(&router, user).await;
    let (agent_conn, mut agent_rx) = connect_agent(&router, 7).await;
    let (_other_conn, mut other_rx) = connect_user(&router, Uuid::new_v4()).await;

    router.join(&room::session(1), user_conn).await;
    router.join(&room::session(1), agent_conn).await;

    router
        .broadcast(
            &room::session(1),
            ServerEvent::MessageRead {
                session_id: 1,
                message_id: 10,
            },
        )
        .await;

    assert_eq!(drain(&mut user_rx).len(), 1);
    assert_eq!(drain(&mut agent_rx).len(), 1);
    assert!(drain(&mut other_rx).is_empty());
}

#[tokio::test]
async fn typing_echo_is_suppressed_for_the_sender() {
    let router = RoomRouter::new();
    let user = Uuid::new_v4();
    let (user_conn, mut user_rx) = connect_user(&router, user).await;
    let (agent_conn, mut agent_rx) = connect_agent(&router, 3).await;

    router.join(&room::session(5), user_conn).await;
    router.join(&room::session(5), agent_conn).await;

    router
        .broadcast_except(
            &room::session(5),
            user_conn,
            ServerEvent::UserTyping {
                session_id: 5,
                user_id: user,
            },
        )
        .await;

    assert!(drain(&mut user_rx).is_empty());
    let received = drain(&mut agent_rx);
    assert_eq!(received.len(), 1);
    assert!(matches!(
        received[0],
        ServerEvent::UserTyping { session_id: 5, .. }
    ));
}

#[tokio::test]
async fn participants_are_split_by_role_and_deduplicated() {
    let router = RoomRouter::new();
    let user = Uuid::new_v4();
    let (first_conn, _first_rx) = connect_user(&router, user).await;
    let (second_conn, _second_rx) = connect_user(&router, user).await;
    let (agent_conn, _agent_rx) = connect_agent(&router, 9).await;

    router.join(&room::session(2), first_conn).await;
    router.join(&room::session(2), second_conn).await;
    router.join(&room::session(2), agent_conn).await;

    let participants = router.session_participants(2).await;
    assert_eq!(participants.users, vec![user]);
    assert_eq!(participants.agents, vec![9]);
}

#[tokio::test]
async fn unregister_removes_the_connection_from_every_room() {
    let router = RoomRouter::new();
    let (conn, mut rx) = connect_agent(&router, 4).await;
    router.join(&room::session(1), conn).await;
    router.join(&room::agent(4), conn).await;

    router.unregister(conn).await;

    assert_eq!(router.room_size(&room::session(1)).await, 0);
    assert_eq!(router.room_size(&room::agent(4)).await, 0);
    assert!(router.online_agents().await.is_empty());

    router
        .broadcast(
            &room::session(1),
            ServerEvent::MessageRead {
                session_id: 1,
                message_id: 1,
            },
        )
        .await;
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn leaving_a_room_keeps_other_memberships() {
    let router = RoomRouter::new();
    let (conn, mut rx) = connect_agent(&router, 11).await;
    router.join(&room::session(1), conn).await;
    router.join(&room::agent(11), conn).await;

    router.leave(&room::session(1), conn).await;

    assert_eq!(router.room_size(&room::session(1)).await, 0);
    assert_eq!(router.room_size(&room::agent(11)).await, 1);

    router
        .broadcast(
            &room::agent(11),
            ServerEvent::AgentStatusChanged {
                agent_id: 11,
                status: chatserver::shared::enums::AgentStatus::Online,
            },
        )
        .await;
    assert_eq!(drain(&mut rx).len(), 1);
}

#[tokio::test]
async fn broadcast_all_reaches_connections_outside_any_room() {
    let router = RoomRouter::new();
    let (_user_conn, mut user_rx) = connect_user(&router, Uuid::new_v4()).await;
    let (_agent_conn, mut agent_rx) = connect_agent(&router, 2).await;

    router
        .broadcast_all(ServerEvent::AgentStatusChanged {
            agent_id: 2,
            status: chatserver::shared::enums::AgentStatus::Offline,
        })
        .await;

    assert_eq!(drain(&mut user_rx).len(), 1);
    assert_eq!(drain(&mut agent_rx).len(), 1);
}

#[tokio::test]
async fn send_to_targets_a_single_connection() {
    let router = RoomRouter::new();
    let (conn, mut rx) = connect_user(&router, Uuid::new_v4()).await;
    let (_other, mut other_rx) = connect_user(&router, Uuid::new_v4()).await;

    router.send_to(conn, ServerEvent::error("only for you")).await;

    let received = drain(&mut rx);
    assert_eq!(received.len(), 1);
    assert!(matches!(received[0], ServerEvent::Notification { .. }));
    assert!(drain(&mut other_rx).is_empty());
}

#[tokio::test]
async fn online_agents_lists_distinct_connected_agents() {
    let router = RoomRouter::new();
    let (_a, _rx_a) = connect_agent(&router, 5).await;
    let (_b, _rx_b) = connect_agent(&router, 5).await;
    let (_c, _rx_c) = connect_agent(&router, 8).await;
    let (_u, _rx_u) = connect_user(&router, Uuid::new_v4()).await;

    assert_eq!(router.online_agents().await, vec![5, 8]);
}
