// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime integration: addressing, request/response, timers, broadcast,
//! service lifecycle.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::{Duration, Instant};

use warren::message::{PTYPE_ERROR, PTYPE_SYSTEM, PTYPE_TEXT};
use warren::{worker_of, Message, Result, Server, Service, ServiceContext};

const WAIT: Duration = Duration::from_secs(5);

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Captures every dispatched message for the test thread.
struct Probe {
    tx: Sender<(u8, i32, String)>,
}

impl Service for Probe {
    fn init(&mut self, _ctx: &mut ServiceContext<'_>) -> Result<()> {
        Ok(())
    }

    fn dispatch(&mut self, _ctx: &mut ServiceContext<'_>, msg: Message) {
        let _ = self
            .tx
            .send((msg.ptype(), msg.session(), msg.text_data().into_owned()));
    }
}

/// Echoes any positive-session text request back, session negated.
struct Echo;

impl Service for Echo {
    fn init(&mut self, _ctx: &mut ServiceContext<'_>) -> Result<()> {
        Ok(())
    }

    fn dispatch(&mut self, ctx: &mut ServiceContext<'_>, msg: Message) {
        if msg.ptype() == PTYPE_TEXT && msg.session() > 0 {
            ctx.response(msg.sender(), "", msg.data(), -msg.session(), PTYPE_TEXT);
        }
    }
}

fn spawn_probe(server: &Server, worker: u32, name: &str) -> (u32, Receiver<(u8, i32, String)>) {
    let (tx, rx) = channel();
    let kind = format!("probe-{}", name);
    server.register(&kind, move |_cfg| Box::new(Probe { tx: tx.clone() }));
    server.new_service(
        worker,
        &kind,
        &format!(r#"{{"name":"{}","unique":true}}"#, name),
        0,
        0,
    );
    let router = server.router().clone();
    wait_until(|| router.get_unique_service(name) != 0);
    (router.get_unique_service(name), rx)
}

#[test]
fn test_echo_request_response_across_workers() {
    let server = Server::init(2, None).unwrap();
    server.register("echo", |_cfg| Box::new(Echo));
    server.new_service(2, "echo", r#"{"name":"echo","unique":true}"#, 0, 0);
    let router = server.router().clone();
    wait_until(|| router.get_unique_service("echo") != 0);
    let echo_sid = router.get_unique_service("echo");
    assert_eq!(worker_of(echo_sid), 2);

    let (probe_sid, rx) = spawn_probe(&server, 1, "prb");
    assert_eq!(worker_of(probe_sid), 1);

    let mut msg = Message::text("hi");
    msg.set_sender(probe_sid);
    msg.set_receiver(echo_sid);
    msg.set_session(7);
    msg.set_ptype(PTYPE_TEXT);
    assert!(router.send(msg));

    let (ptype, session, data) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(ptype, PTYPE_TEXT);
    assert_eq!(session, -7);
    assert_eq!(data, "hi");
}

#[test]
fn test_dead_receiver_answers_error() {
    let server = Server::init(2, None).unwrap();
    let (probe_sid, rx) = spawn_probe(&server, 1, "deadprb");
    let router = server.router().clone();

    let mut msg = Message::text("anyone there?");
    msg.set_sender(probe_sid);
    msg.set_receiver(0x0002_0099);
    msg.set_session(5);
    msg.set_ptype(PTYPE_TEXT);
    assert!(router.send(msg));

    let (ptype, session, data) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(ptype, PTYPE_ERROR);
    assert_eq!(session, -5);
    assert!(data.contains("dead service"), "payload: {}", data);
}

#[test]
fn test_invalid_worker_drops() {
    let server = Server::init(1, None).unwrap();
    let router = server.router().clone();
    let mut msg = Message::text("x");
    msg.set_receiver(0x00FF_0001); // worker 255 does not exist
    assert!(!router.send(msg));
}

#[test]
fn test_unique_name_conflict_fails_second_init() {
    let server = Server::init(2, None).unwrap();
    server.register("echo", |_cfg| Box::new(Echo));
    server.new_service(1, "echo", r#"{"name":"solo","unique":true}"#, 0, 0);
    let router = server.router().clone();
    wait_until(|| router.get_unique_service("solo") != 0);
    let first = router.get_unique_service("solo");

    let (probe_sid, rx) = spawn_probe(&server, 2, "uniqprb");
    // second instance, requested with a session so the failure comes back
    router.new_service(2, "echo", r#"{"name":"solo","unique":true}"#, probe_sid, 9);

    let (ptype, session, data) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(ptype, PTYPE_ERROR);
    assert_eq!(session, -9);
    assert!(data.contains("solo"), "payload: {}", data);

    // registry still points at the first instance, slot freed
    assert_eq!(router.get_unique_service("solo"), first);
    wait_until(|| router.service_count() == 2);
}

struct TimerProbe {
    tx: Sender<(u32, bool)>,
    cancel_after_first: bool,
    timer_id: u32,
}

impl Service for TimerProbe {
    fn init(&mut self, _ctx: &mut ServiceContext<'_>) -> Result<()> {
        Ok(())
    }

    fn start(&mut self, ctx: &mut ServiceContext<'_>) {
        let times = if self.cancel_after_first { -1 } else { 3 };
        self.timer_id = ctx.repeat(50, times);
        assert_ne!(self.timer_id, 0);
    }

    fn dispatch(&mut self, _ctx: &mut ServiceContext<'_>, _msg: Message) {}

    fn on_timer(&mut self, ctx: &mut ServiceContext<'_>, timer_id: u32, removed: bool) {
        let _ = self.tx.send((timer_id, removed));
        if self.cancel_after_first {
            ctx.remove_timer(timer_id);
        }
    }
}

#[test]
fn test_timer_fires_exactly_n_times() {
    let server = Server::init(1, None).unwrap();
    let (tx, rx) = channel();
    server.register("timer-probe", move |_cfg| {
        Box::new(TimerProbe {
            tx: tx.clone(),
            cancel_after_first: false,
            timer_id: 0,
        })
    });
    server.new_service(1, "timer-probe", r#"{"name":"tmr"}"#, 0, 0);

    let mut fires = Vec::new();
    for _ in 0..3 {
        fires.push(rx.recv_timeout(WAIT).unwrap());
    }
    assert_eq!(
        fires.iter().map(|f| f.1).collect::<Vec<_>>(),
        vec![false, false, true]
    );
    // no fourth fire
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn test_timer_remove_stops_repeats() {
    let server = Server::init(1, None).unwrap();
    let (tx, rx) = channel();
    server.register("timer-probe", move |_cfg| {
        Box::new(TimerProbe {
            tx: tx.clone(),
            cancel_after_first: true,
            timer_id: 0,
        })
    });
    server.new_service(1, "timer-probe", r#"{"name":"tmr2"}"#, 0, 0);

    let (_, removed) = rx.recv_timeout(WAIT).unwrap();
    assert!(!removed);
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}

struct Subscriber {
    tx: Sender<String>,
}

impl Service for Subscriber {
    fn init(&mut self, ctx: &mut ServiceContext<'_>) -> Result<()> {
        ctx.subscribe(PTYPE_SYSTEM);
        Ok(())
    }

    fn dispatch(&mut self, _ctx: &mut ServiceContext<'_>, msg: Message) {
        if msg.ptype() == PTYPE_SYSTEM {
            let _ = self.tx.send(msg.text_data().into_owned());
        }
    }
}

#[test]
fn test_broadcast_reaches_each_subscriber_once() {
    let server = Server::init(2, None).unwrap();
    let (tx, rx) = channel();
    server.register("subscriber", move |_cfg| {
        Box::new(Subscriber { tx: tx.clone() })
    });
    server.new_service(1, "subscriber", r#"{"name":"sub1"}"#, 0, 0);
    server.new_service(2, "subscriber", r#"{"name":"sub2"}"#, 0, 0);
    let router = server.router().clone();
    wait_until(|| router.service_count() == 2);

    router.broadcast(
        warren::Buffer::from_slice(b"config changed"),
        "",
        PTYPE_SYSTEM,
        0x0001_0001,
    );

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "config changed");
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "config changed");
    // exactly twice
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn test_remove_service_confirms_and_goes_dead() {
    let server = Server::init(1, None).unwrap();
    server.register("echo", |_cfg| Box::new(Echo));
    server.new_service(1, "echo", r#"{"name":"victim","unique":true}"#, 0, 0);
    let router = server.router().clone();
    wait_until(|| router.get_unique_service("victim") != 0);
    let victim = router.get_unique_service("victim");

    let (probe_sid, rx) = spawn_probe(&server, 1, "rmprb");
    router.remove_service(victim, probe_sid, 3);

    let (ptype, session, data) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(ptype, PTYPE_TEXT);
    assert_eq!(session, -3);
    assert!(data.contains("destroyed"), "payload: {}", data);
    assert_eq!(router.get_unique_service("victim"), 0);

    // no dispatch happens after removal; a session send answers dead
    let mut msg = Message::text("late");
    msg.set_sender(probe_sid);
    msg.set_receiver(victim);
    msg.set_session(4);
    msg.set_ptype(PTYPE_TEXT);
    router.send(msg);

    let (ptype, session, data) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(ptype, PTYPE_ERROR);
    assert_eq!(session, -4);
    assert!(data.contains("dead service"));
}

#[test]
fn test_env_map_and_admin_commands() {
    let server = Server::init(2, None).unwrap();
    let router = server.router().clone();

    router.set_env("GAME", "sample");
    assert_eq!(router.get_env("GAME").as_deref(), Some("sample"));

    let (probe_sid, rx) = spawn_probe(&server, 1, "admprb");

    router.runcmd("service_count", probe_sid, 21);
    let (ptype, session, data) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(ptype, PTYPE_TEXT);
    assert_eq!(session, -21);
    assert_eq!(data, "1");

    router.runcmd("wstate", probe_sid, 22);
    let (_, session, data) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(session, -22);
    let parsed: serde_json::Value = serde_json::from_str(&data).unwrap();
    assert_eq!(parsed.as_array().unwrap().len(), 2);

    router.runcmd("set_loglevel debug", probe_sid, 23);
    let (ptype, session, _) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(ptype, PTYPE_TEXT);
    assert_eq!(session, -23);

    router.runcmd("not_a_command", probe_sid, 24);
    let (ptype, session, _) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(ptype, PTYPE_ERROR);
    assert_eq!(session, -24);
}

#[test]
fn test_single_sender_fifo_order() {
    let server = Server::init(2, None).unwrap();
    let (probe_sid, rx) = spawn_probe(&server, 2, "fifoprb");
    let router = server.router().clone();

    for i in 0..100 {
        let mut msg = Message::text(&i.to_string());
        msg.set_sender(0x0001_0001);
        msg.set_receiver(probe_sid);
        msg.set_ptype(PTYPE_TEXT);
        router.send(msg);
    }

    for i in 0..100 {
        let (_, _, data) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(data, i.to_string());
    }
}

/// Builds one prefab and sends it to a named probe several times.
struct Prefabber {
    target: String,
}

impl Service for Prefabber {
    fn init(&mut self, _ctx: &mut ServiceContext<'_>) -> Result<()> {
        Ok(())
    }

    fn start(&mut self, ctx: &mut ServiceContext<'_>) {
        let target = ctx.query_service(&self.target);
        assert_ne!(target, 0);
        let prefab = ctx.make_prefab(warren::Buffer::from_slice(b"motd"));
        assert_ne!(prefab, 0);
        for _ in 0..3 {
            assert!(ctx.send_prefab(target, prefab, "", 0, PTYPE_TEXT));
        }
        assert!(!ctx.send_prefab(target, prefab + 1, "", 0, PTYPE_TEXT));
    }

    fn dispatch(&mut self, _ctx: &mut ServiceContext<'_>, _msg: Message) {}
}

#[test]
fn test_prefab_sends_share_one_payload() {
    let server = Server::init(2, None).unwrap();
    let (_, rx) = spawn_probe(&server, 2, "pfprb");
    server.register("prefabber", |_cfg| {
        Box::new(Prefabber {
            target: "pfprb".into(),
        })
    });
    server.new_service(1, "prefabber", r#"{"name":"pf"}"#, 0, 0);

    for _ in 0..3 {
        let (ptype, _, data) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(ptype, PTYPE_TEXT);
        assert_eq!(data, "motd");
    }
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}

/// Escalates a failure on its first message.
struct Fragile;

impl Service for Fragile {
    fn init(&mut self, _ctx: &mut ServiceContext<'_>) -> Result<()> {
        Ok(())
    }

    fn dispatch(&mut self, ctx: &mut ServiceContext<'_>, _msg: Message) {
        ctx.error("state corrupted");
    }
}

#[test]
fn test_unique_service_failure_is_fail_stop() {
    let server = Server::init(1, None).unwrap();
    server.register("fragile", |_cfg| Box::new(Fragile));
    server.new_service(1, "fragile", r#"{"name":"critical","unique":true}"#, 0, 0);
    let router = server.router().clone();
    wait_until(|| router.get_unique_service("critical") != 0);
    let sid = router.get_unique_service("critical");

    let mut msg = Message::text("poke");
    msg.set_receiver(sid);
    msg.set_ptype(PTYPE_TEXT);
    router.send(msg);

    // a crashed unique service requests a server-wide stop
    wait_until(|| router.stop_requested());
    // and its slot is gone
    wait_until(|| router.service_count() == 0);
}

#[test]
fn test_abort_stops_server() {
    let mut server = Server::init(1, None).unwrap();
    let router = server.router().clone();
    router.runcmd("abort", 0, 0);
    assert!(router.stop_requested());
    // run() returns promptly once stop is requested
    server.run();
    assert_eq!(server.state(), warren::server::State::Exited);
}
