//! TCP transport: one connection per peer session, carrying length-prefixed link frames.
//!
//! Negotiation maps onto plain TCP: an offer or answer carries the sender's listen
//! address. The responder dials the initiator and opens with `Hello`; the initiator's
//! listener matches the hello to the session waiting for that peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use parley_core::signaling::{IceCandidate, SessionDescription};
use parley_core::transport::{
    ChannelHandle, ConnectionState, TransportError, TransportEvent, TransportHandle,
    TransportProvider,
};
use parley_core::wire::{decode_frame, encode_frame, FrameDecodeError};
use parley_core::{LinkFrame, PeerId, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const READ_BUF: usize = 64 * 1024;

#[derive(Default)]
struct Links {
    peers: HashMap<u64, PeerId>,
    writers: HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>,
}

type SharedLinks = Arc<Mutex<Links>>;

fn lock(links: &SharedLinks) -> MutexGuard<'_, Links> {
    links.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct TcpTransport {
    local_id: PeerId,
    advertise: String,
    next: u64,
    links: SharedLinks,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl TcpTransport {
    /// Bind the listener and start accepting peer links. Events for the core arrive on
    /// the returned receiver.
    pub async fn bind(
        local_id: PeerId,
        port: u16,
        advertise: String,
    ) -> std::io::Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        log::info!("peer links on port {} (advertised as {})", port, advertise);
        let (tx, rx) = mpsc::unbounded_channel();
        let links = SharedLinks::default();
        tokio::spawn(accept_loop(listener, links.clone(), tx.clone()));
        Ok((
            Self {
                local_id,
                advertise,
                next: 0,
                links,
                events: tx,
            },
            rx,
        ))
    }

    fn peer_of(&self, handle: TransportHandle) -> Result<PeerId, TransportError> {
        lock(&self.links)
            .peers
            .get(&handle.0)
            .cloned()
            .ok_or(TransportError::UnknownHandle)
    }
}

impl TransportProvider for TcpTransport {
    fn create(&mut self, peer_id: &PeerId) -> Result<TransportHandle, TransportError> {
        self.next += 1;
        lock(&self.links).peers.insert(self.next, peer_id.clone());
        Ok(TransportHandle(self.next))
    }

    fn create_offer(
        &mut self,
        handle: TransportHandle,
    ) -> Result<SessionDescription, TransportError> {
        self.peer_of(handle)?;
        Ok(SessionDescription::offer(format!("tcp {}", self.advertise)))
    }

    fn accept_offer(
        &mut self,
        handle: TransportHandle,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        let peer_id = self.peer_of(handle)?;
        let addr = parse_description(&offer.sdp)?;
        tokio::spawn(dial(
            addr,
            handle.0,
            peer_id,
            self.local_id.clone(),
            self.links.clone(),
            self.events.clone(),
        ));
        Ok(SessionDescription::answer(format!("tcp {}", self.advertise)))
    }

    fn accept_answer(
        &mut self,
        handle: TransportHandle,
        answer: &SessionDescription,
    ) -> Result<(), TransportError> {
        // The responder dials us; the answer only has to be well formed.
        self.peer_of(handle)?;
        parse_description(&answer.sdp).map(|_| ())
    }

    fn add_candidate(
        &mut self,
        _handle: TransportHandle,
        candidate: &IceCandidate,
    ) -> Result<(), TransportError> {
        log::debug!("tcp transport ignores candidate {}", candidate.candidate);
        Ok(())
    }

    fn open_channel(
        &mut self,
        handle: TransportHandle,
        _label: &str,
    ) -> Result<ChannelHandle, TransportError> {
        self.peer_of(handle)?;
        Ok(ChannelHandle(handle.0))
    }

    fn send(&mut self, channel: ChannelHandle, data: &str) -> Result<(), TransportError> {
        let bytes = encode_frame(&LinkFrame::Data(data.to_string()))
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let links = lock(&self.links);
        let writer = links
            .writers
            .get(&channel.0)
            .ok_or(TransportError::ChannelClosed)?;
        writer.send(bytes).map_err(|_| TransportError::ChannelClosed)
    }

    fn close(&mut self, handle: TransportHandle) {
        let mut links = lock(&self.links);
        links.peers.remove(&handle.0);
        // Dropping the writer ends the write task, which shuts the socket down.
        links.writers.remove(&handle.0);
    }
}

/// Offers and answers look like `tcp host:port`.
fn parse_description(sdp: &str) -> Result<SocketAddr, TransportError> {
    sdp.strip_prefix("tcp ")
        .and_then(|a| a.trim().parse().ok())
        .ok_or_else(|| TransportError::InvalidDescription(sdp.to_string()))
}

async fn accept_loop(
    listener: TcpListener,
    links: SharedLinks,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                log::warn!("accept failed: {}", e);
                continue;
            }
        };
        let links = links.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let (mut rd, wr) = stream.into_split();
            let mut buf = Vec::new();
            let peer_id = match read_frame(&mut rd, &mut buf).await {
                Ok(Some(LinkFrame::Hello {
                    protocol_version,
                    peer_id,
                })) if protocol_version == PROTOCOL_VERSION => PeerId::new(peer_id),
                Ok(other) => {
                    log::warn!("{}: expected hello, got {:?}", addr, other);
                    return;
                }
                Err(e) => {
                    log::warn!("{}: bad hello: {}", addr, e);
                    return;
                }
            };
            // Newest session for the peer that has no link yet.
            let handle = {
                let l = lock(&links);
                l.peers
                    .iter()
                    .filter(|(h, p)| **p == peer_id && !l.writers.contains_key(*h))
                    .map(|(h, _)| *h)
                    .max()
            };
            match handle {
                Some(h) => run_link(h, peer_id, rd, wr, buf, links, events).await,
                None => log::warn!("{}: no session waiting for {}", addr, peer_id),
            }
        });
    }
}

async fn dial(
    addr: SocketAddr,
    handle: u64,
    peer_id: PeerId,
    local_id: PeerId,
    links: SharedLinks,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let result = async {
        let stream = TcpStream::connect(addr).await?;
        let (rd, mut wr) = stream.into_split();
        let hello = encode_frame(&LinkFrame::Hello {
            protocol_version: PROTOCOL_VERSION,
            peer_id: local_id.to_string(),
        })
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        wr.write_all(&hello).await?;
        Ok::<_, std::io::Error>((rd, wr))
    }
    .await;
    match result {
        Ok((rd, wr)) => run_link(handle, peer_id, rd, wr, Vec::new(), links, events).await,
        Err(e) => {
            log::warn!("dial {} at {} failed: {}", peer_id, addr, e);
            let _ = events.send(TransportEvent::StateChanged {
                peer_id,
                state: ConnectionState::Failed,
            });
        }
    }
}

/// Own an established link until either side drops it.
async fn run_link(
    handle: u64,
    peer_id: PeerId,
    mut rd: OwnedReadHalf,
    wr: OwnedWriteHalf,
    mut buf: Vec<u8>,
    links: SharedLinks,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    {
        let mut l = lock(&links);
        if !l.peers.contains_key(&handle) {
            log::debug!("session {} for {} closed before the link came up", handle, peer_id);
            return;
        }
        l.writers.insert(handle, tx);
    }
    tokio::spawn(write_loop(wr, rx));
    log::info!("link to {} up", peer_id);
    let _ = events.send(TransportEvent::StateChanged {
        peer_id: peer_id.clone(),
        state: ConnectionState::Connected,
    });
    let _ = events.send(TransportEvent::ChannelOpen {
        peer_id: peer_id.clone(),
        channel: ChannelHandle(handle),
    });

    let outcome = loop {
        match read_frame(&mut rd, &mut buf).await {
            Ok(Some(LinkFrame::Data(data))) => {
                let _ = events.send(TransportEvent::ChannelMessage {
                    peer_id: peer_id.clone(),
                    data,
                });
            }
            Ok(Some(LinkFrame::Hello { .. })) => log::debug!("stray hello from {}", peer_id),
            Ok(None) => break ConnectionState::Disconnected,
            Err(e) => {
                log::warn!("link to {} failed: {}", peer_id, e);
                break ConnectionState::Failed;
            }
        }
    };

    // Only report the loss if this link still belongs to a live session.
    let ours = {
        let mut l = lock(&links);
        l.peers.contains_key(&handle) && l.writers.remove(&handle).is_some()
    };
    if ours {
        log::info!("link to {} down ({:?})", peer_id, outcome);
        let _ = events.send(TransportEvent::ChannelClosed {
            peer_id: peer_id.clone(),
        });
        let _ = events.send(TransportEvent::StateChanged {
            peer_id,
            state: outcome,
        });
    }
}

async fn write_loop(mut wr: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = wr.write_all(&bytes).await {
            log::debug!("write failed: {}", e);
            break;
        }
    }
    let _ = wr.shutdown().await;
}

/// Read one link frame. `Ok(None)` on clean EOF between frames. Leftover bytes stay in
/// `buf` for the next call.
async fn read_frame(
    rd: &mut OwnedReadHalf,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<LinkFrame>> {
    let mut chunk = vec![0u8; READ_BUF];
    loop {
        match decode_frame(buf) {
            Ok((frame, used)) => {
                buf.drain(..used);
                return Ok(Some(frame));
            }
            Err(FrameDecodeError::NeedMore) => {}
            Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        }
        let n = rd.read(&mut chunk).await?;
        if n == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(std::io::ErrorKind::UnexpectedEof.into())
            };
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptions_carry_addresses() {
        assert_eq!(
            parse_description("tcp 10.0.0.5:47800").unwrap(),
            "10.0.0.5:47800".parse::<SocketAddr>().unwrap()
        );
        assert!(matches!(
            parse_description("v=0 o=- 0 0 IN IP4 0.0.0.0"),
            Err(TransportError::InvalidDescription(_))
        ));
    }

    #[tokio::test]
    async fn responder_dials_initiator() {
        let (mut alice, mut alice_rx) =
            TcpTransport::bind(PeerId::from("alice"), 0, String::new())
                .await
                .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (mut bob, mut bob_rx) =
            TcpTransport::bind(PeerId::from("bob"), addr.port(), addr.to_string())
                .await
                .unwrap();

        let bh = bob.create(&PeerId::from("alice")).unwrap();
        let bc = bob.open_channel(bh, "chat").unwrap();
        let offer = bob.create_offer(bh).unwrap();

        let ah = alice.create(&PeerId::from("bob")).unwrap();
        let ac = alice.open_channel(ah, "chat").unwrap();
        let answer = alice.accept_offer(ah, &offer).unwrap();
        assert_eq!(answer.kind, parley_core::signaling::SdpKind::Answer);

        let mut opened = 0;
        for rx in [&mut alice_rx, &mut bob_rx] {
            while let Some(ev) = rx.recv().await {
                if matches!(ev, TransportEvent::ChannelOpen { .. }) {
                    opened += 1;
                    break;
                }
            }
        }
        assert_eq!(opened, 2);

        alice.send(ac, "ping").unwrap();
        loop {
            match bob_rx.recv().await.unwrap() {
                TransportEvent::ChannelMessage { peer_id, data } => {
                    assert_eq!(peer_id.as_str(), "alice");
                    assert_eq!(data, "ping");
                    break;
                }
                _ => continue,
            }
        }
        bob.close(bh);
        assert!(matches!(bob.send(bc, "x"), Err(TransportError::ChannelClosed)));
    }
}
