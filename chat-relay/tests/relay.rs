use std::{net::SocketAddr, time::Duration};

use anyhow::{anyhow, Result};
use chat_relay::{
    config::RelayConfig,
    packet::{decode, read_record, write_packet, Action, Packet},
    server::Server,
};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
/// Time given to the coordinator to register a login before the next step.
const SETTLE: Duration = Duration::from_millis(100);

struct TestServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = Server::new(listener, RelayConfig::default());
        let addr = server.local_addr()?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = server.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            shutdown,
            task,
        })
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

struct Peer {
    userid: String,
    reader: BufReader<OwnedReadHalf>,
    pending: Vec<u8>,
    writer: OwnedWriteHalf,
}

impl Peer {
    async fn connect(addr: SocketAddr, userid: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            userid: userid.to_string(),
            reader: BufReader::new(reader),
            pending: Vec::new(),
            writer,
        })
    }

    /// Connects, logs in, and waits for the coordinator to catch up.
    async fn login(addr: SocketAddr, userid: &str) -> Result<Self> {
        let mut peer = Self::connect(addr, userid).await?;
        peer.send(&Packet::login(userid)).await?;
        sleep(SETTLE).await;
        Ok(peer)
    }

    async fn send(&mut self, packet: &Packet) -> Result<()> {
        write_packet(&mut self.writer, packet).await?;
        Ok(())
    }

    async fn say(&mut self, text: &str) -> Result<()> {
        let packet = Packet::msg(self.userid.clone(), text);
        self.send(&packet).await
    }

    async fn recv(&mut self) -> Result<Option<Packet>> {
        let read = read_record(&mut self.reader, &mut self.pending);
        let record = timeout(READ_TIMEOUT, read).await??;
        match record {
            Some(record) => Ok(Some(decode(&record)?)),
            None => Ok(None),
        }
    }

    async fn expect(&mut self) -> Result<Packet> {
        self.recv()
            .await?
            .ok_or_else(|| anyhow!("{}: connection closed unexpectedly", self.userid))
    }

    async fn expect_closed(&mut self) -> Result<()> {
        match self.recv().await? {
            None => Ok(()),
            Some(packet) => Err(anyhow!("{}: expected close, got {packet:?}", self.userid)),
        }
    }

    /// Consumes the join notice announcing `userid`.
    async fn expect_joined(&mut self, userid: &str) -> Result<()> {
        let packet = self.expect().await?;
        if packet.action != Action::Msg
            || packet.userid != userid
            || !packet.data.starts_with("Entered chat (")
        {
            return Err(anyhow!("{}: expected {userid} to join, got {packet:?}", self.userid));
        }
        Ok(())
    }
}

#[tokio::test]
async fn logged_in_clients_exchange_messages_without_echo() -> Result<()> {
    let server = TestServer::start().await?;

    let mut alice = Peer::login(server.addr, "alice").await?;
    let mut bob = Peer::login(server.addr, "bob").await?;

    // alice hears nothing about her own login; the first thing she sees is bob.
    alice.expect_joined("bob").await?;

    alice.say("hi").await?;
    assert_eq!(bob.expect().await?, Packet::msg("alice", "hi"));

    bob.say("hey alice").await?;
    assert_eq!(alice.expect().await?, Packet::msg("bob", "hey alice"));

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_login_is_reported_and_not_registered() -> Result<()> {
    let server = TestServer::start().await?;

    let mut alice = Peer::login(server.addr, "alice").await?;
    let mut bob = Peer::login(server.addr, "bob").await?;
    alice.expect_joined("bob").await?;

    let mut impostor = Peer::login(server.addr, "alice").await?;

    let notice = Packet::msg("server", "userid alice is already logged in");
    assert_eq!(alice.expect().await?, notice);
    assert_eq!(bob.expect().await?, notice);
    impostor.expect_closed().await?;

    // Exactly one alice is still registered.
    bob.say("one").await?;
    bob.say("two").await?;
    assert_eq!(alice.expect().await?, Packet::msg("bob", "one"));
    assert_eq!(alice.expect().await?, Packet::msg("bob", "two"));

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn rejected_duplicate_cannot_speak_for_the_owner() -> Result<()> {
    let server = TestServer::start().await?;

    let mut alice = Peer::login(server.addr, "alice").await?;
    let mut bob = Peer::login(server.addr, "bob").await?;
    alice.expect_joined("bob").await?;

    let mut impostor = Peer::connect(server.addr, "alice").await?;
    impostor.send(&Packet::login("alice")).await?;
    impostor.say("send me your password").await?;

    let notice = Packet::msg("server", "userid alice is already logged in");
    assert_eq!(bob.expect().await?, notice);
    impostor.expect_closed().await?;

    alice.say("that was not me").await?;
    assert_eq!(bob.expect().await?, Packet::msg("alice", "that was not me"));

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_duplicate_logins_register_exactly_one() -> Result<()> {
    let server = TestServer::start().await?;
    let mut observer = Peer::login(server.addr, "observer").await?;

    let mut contenders = Vec::new();
    for _ in 0..5 {
        contenders.push(Peer::connect(server.addr, "zed").await?);
    }
    for contender in &mut contenders {
        contender.send(&Packet::login("zed")).await?;
    }

    let mut joins = 0;
    let mut duplicates = 0;
    for _ in 0..5 {
        let packet = observer.expect().await?;
        match packet.userid.as_str() {
            "zed" => joins += 1,
            "server" if packet.data == "userid zed is already logged in" => duplicates += 1,
            _ => return Err(anyhow!("unexpected packet {packet:?}")),
        }
    }
    assert_eq!((joins, duplicates), (1, 4));

    // Four contenders are disconnected; the survivor still receives messages.
    observer.say("who is left?").await?;
    let mut closed = 0;
    for contender in &mut contenders {
        match contender.recv().await? {
            None => closed += 1,
            Some(packet) => {
                // The survivor may see duplicate notices before the message.
                let mut packet = packet;
                while packet.userid == "server" {
                    packet = contender.expect().await?;
                }
                assert_eq!(packet, Packet::msg("observer", "who is left?"));
            }
        }
    }
    assert_eq!(closed, 4);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn quit_removes_client_and_closes_its_connection() -> Result<()> {
    let server = TestServer::start().await?;

    let mut alice = Peer::login(server.addr, "alice").await?;
    let mut bob = Peer::login(server.addr, "bob").await?;
    alice.expect_joined("bob").await?;

    bob.send(&Packet::quit("bob")).await?;
    assert_eq!(alice.expect().await?, Packet::msg("bob", "Left chat"));
    bob.expect_closed().await?;

    // bob's userid is free again.
    let mut bob_again = Peer::login(server.addr, "bob").await?;
    alice.expect_joined("bob").await?;
    alice.say("welcome back").await?;
    assert_eq!(bob_again.expect().await?, Packet::msg("alice", "welcome back"));

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn abrupt_disconnect_is_treated_as_quit() -> Result<()> {
    let server = TestServer::start().await?;

    let mut alice = Peer::login(server.addr, "alice").await?;
    let bob = Peer::login(server.addr, "bob").await?;
    alice.expect_joined("bob").await?;

    drop(bob);
    assert_eq!(alice.expect().await?, Packet::msg("bob", "Left chat"));

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn malformed_record_only_disconnects_its_sender() -> Result<()> {
    let server = TestServer::start().await?;

    let mut alice = Peer::login(server.addr, "alice").await?;
    let mut bob = Peer::login(server.addr, "bob").await?;
    let mut carol = Peer::login(server.addr, "carol").await?;
    alice.expect_joined("bob").await?;
    alice.expect_joined("carol").await?;
    bob.expect_joined("carol").await?;

    carol.writer.write_all(b"definitely not json\n").await?;

    assert_eq!(alice.expect().await?, Packet::msg("carol", "Left chat"));
    assert_eq!(bob.expect().await?, Packet::msg("carol", "Left chat"));
    carol.expect_closed().await?;

    alice.say("still working?").await?;
    assert_eq!(bob.expect().await?, Packet::msg("alice", "still working?"));
    bob.say("yes").await?;
    assert_eq!(alice.expect().await?, Packet::msg("bob", "yes"));

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn every_observer_sees_the_same_message_order() -> Result<()> {
    const PER_SENDER: usize = 20;
    let server = TestServer::start().await?;

    let mut carol = Peer::login(server.addr, "carol").await?;
    let mut dave = Peer::login(server.addr, "dave").await?;
    let mut alice = Peer::login(server.addr, "alice").await?;
    let mut bob = Peer::login(server.addr, "bob").await?;
    for userid in ["dave", "alice", "bob"] {
        carol.expect_joined(userid).await?;
    }
    for userid in ["alice", "bob"] {
        dave.expect_joined(userid).await?;
    }
    alice.expect_joined("bob").await?;

    let (sent_a, sent_b) = tokio::join!(
        async {
            for n in 0..PER_SENDER {
                alice.say(&format!("a{n}")).await?;
            }
            Ok::<_, anyhow::Error>(())
        },
        async {
            for n in 0..PER_SENDER {
                bob.say(&format!("b{n}")).await?;
            }
            Ok::<_, anyhow::Error>(())
        }
    );
    sent_a?;
    sent_b?;

    let mut carol_seen = Vec::new();
    let mut dave_seen = Vec::new();
    for _ in 0..PER_SENDER * 2 {
        carol_seen.push(carol.expect().await?.data);
        dave_seen.push(dave.expect().await?.data);
    }

    assert_eq!(carol_seen, dave_seen);
    let from_alice: Vec<_> = carol_seen.iter().filter(|text| text.starts_with('a')).collect();
    let expected: Vec<_> = (0..PER_SENDER).map(|n| format!("a{n}")).collect();
    assert_eq!(from_alice, expected.iter().collect::<Vec<_>>());

    server.stop().await;
    Ok(())
}
