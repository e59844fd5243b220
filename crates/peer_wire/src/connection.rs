use crate::errors::{ErrorKind, Result};
use crate::extended::{ExtendedHandshake, UtMetadataMessage, UT_METADATA_LOCAL_ID};
use crate::handshake::{Handshake, HANDSHAKE_LEN};
use crate::message::{PeerMessage, LENGTH_PREFIX_LEN};
use crate::ring::RingBuffer;
use crate::transport::PeerTransport;
use byteorder::{BigEndian, ByteOrder};
use krpc_encoding::U160;
use log::{debug, trace, warn};
use rand::seq::SliceRandom;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

type BlockHandler = Box<dyn FnMut(u32, u32, Vec<u8>) + Send>;
type PieceDataHandler = Box<dyn FnMut(u32, Vec<u8>) + Send>;
type ExtendedHandshakeHandler = Box<dyn FnMut(u32, u64) + Send>;

/// Drives one peer's handshake, extended handshake and message stream
/// (spec.md §4.9). Owns no knowledge of which torrent it belongs to
/// beyond the info-hash it was created with; the resolver supplies
/// handlers to react to what it observes.
pub struct PeerConnection<T: PeerTransport> {
    transport: T,
    ring: RingBuffer,
    state: ConnectionState,

    local_id: U160,
    info_hash: U160,
    listen_port: u16,

    pub peer_id: Option<U160>,
    handshake_completed: bool,
    pending_frame_len: Option<u32>,

    pub peer_choke: bool,
    pub bitfield: Vec<bool>,
    pub peer_extension_ids: HashMap<String, u8>,
    pub metadata_size: Option<u64>,
    pub piece_count: Option<u32>,

    unchoke_handler: Option<Box<dyn FnMut() + Send>>,
    extended_handshake_handler: Option<ExtendedHandshakeHandler>,
    block_handler: Option<BlockHandler>,
    piece_data_handler: Option<PieceDataHandler>,
}

/// A frame's worth of ring buffer headroom on top of the largest payload
/// we expect (one 16 KiB metadata piece plus its bencoded envelope).
const RING_CAPACITY: usize = 64 * 1024;

impl<T: PeerTransport> PeerConnection<T> {
    pub fn new(transport: T, local_id: U160, info_hash: U160, listen_port: u16) -> PeerConnection<T> {
        PeerConnection {
            transport,
            ring: RingBuffer::with_capacity(RING_CAPACITY),
            state: ConnectionState::Connecting,
            local_id,
            info_hash,
            listen_port,
            peer_id: None,
            handshake_completed: false,
            pending_frame_len: None,
            peer_choke: true,
            bitfield: Vec::new(),
            peer_extension_ids: HashMap::new(),
            metadata_size: None,
            piece_count: None,
            unchoke_handler: None,
            extended_handshake_handler: None,
            block_handler: None,
            piece_data_handler: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn on_unchoke(&mut self, handler: impl FnMut() + Send + 'static) {
        self.unchoke_handler = Some(Box::new(handler));
    }

    pub fn on_extended_handshake(&mut self, handler: impl FnMut(u32, u64) + Send + 'static) {
        self.extended_handshake_handler = Some(Box::new(handler));
    }

    pub fn on_block(&mut self, handler: impl FnMut(u32, u32, Vec<u8>) + Send + 'static) {
        self.block_handler = Some(Box::new(handler));
    }

    /// `Connecting --socket connected--> Connected`: sends our handshake
    /// and extended handshake.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != ConnectionState::Connecting {
            return Err(ErrorKind::InvalidStatus.into());
        }

        let handshake = Handshake::new(self.info_hash, self.local_id);
        self.transport.write_all(&handshake.encode()).await?;

        let extended = ExtendedHandshake::ours(self.listen_port);
        let frame = PeerMessage::Extended {
            id: 0,
            payload: extended.encode()?,
        };
        self.transport.write_all(&frame.encode()).await?;

        self.state = ConnectionState::Connected;
        Ok(())
    }

    /// Reads whatever is available on the socket and drains every
    /// complete handshake/frame the ring buffer now holds.
    pub async fn read_once(&mut self) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(ErrorKind::InvalidStatus.into());
        }

        let mut scratch = [0u8; 4096];
        let n = self.transport.read(&mut scratch).await?;
        if n == 0 {
            self.close();
            return Ok(());
        }

        let span = self.ring.use_for_append(n)?;
        span.copy_from_slice(&scratch[..n]);
        self.ring.appended(n);

        self.drain_ring()?;
        Ok(())
    }

    fn drain_ring(&mut self) -> Result<()> {
        loop {
            if !self.handshake_completed {
                if self.ring.data_size() < HANDSHAKE_LEN {
                    return Ok(());
                }
                let mut buf = [0u8; HANDSHAKE_LEN];
                self.ring.pop_data(&mut buf, HANDSHAKE_LEN)?;
                let handshake = Handshake::decode(&buf)?;
                if handshake.info_hash != self.info_hash {
                    self.close();
                    return Ok(());
                }
                self.peer_id = Some(handshake.peer_id);
                self.handshake_completed = true;
                continue;
            }

            match self.pending_frame_len {
                None => {
                    if self.ring.data_size() < LENGTH_PREFIX_LEN {
                        return Ok(());
                    }
                    let mut len_bytes = [0u8; LENGTH_PREFIX_LEN];
                    self.ring.pop_data(&mut len_bytes, LENGTH_PREFIX_LEN)?;
                    let len = BigEndian::read_u32(&len_bytes);
                    if len == 0 {
                        trace!("peer keep-alive");
                        continue;
                    }
                    self.pending_frame_len = Some(len);
                }
                Some(len) => {
                    let len = len as usize;
                    if self.ring.data_size() < len {
                        return Ok(());
                    }
                    let mut body = vec![0u8; len];
                    self.ring.pop_data(&mut body, len)?;
                    self.pending_frame_len = None;
                    let message = PeerMessage::decode_body(&body)?;
                    self.dispatch(message)?;
                }
            }
        }
    }

    fn dispatch(&mut self, message: PeerMessage) -> Result<()> {
        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => self.peer_choke = true,
            PeerMessage::Unchoke => {
                self.peer_choke = false;
                if let Some(handler) = &mut self.unchoke_handler {
                    handler();
                }
            }
            PeerMessage::Interested | PeerMessage::NotInterested => {}
            PeerMessage::Have { piece } => {
                let idx = piece as usize;
                if self.bitfield.len() <= idx {
                    self.bitfield.resize(idx + 1, false);
                }
                self.bitfield[idx] = true;
            }
            PeerMessage::Bitfield(bytes) => {
                self.bitfield = bytes_to_bits(&bytes);
            }
            PeerMessage::Request { .. } | PeerMessage::Cancel { .. } | PeerMessage::Port(_) => {}
            PeerMessage::Piece { index, begin, block } => {
                if let Some(handler) = &mut self.block_handler {
                    handler(index, begin, block);
                }
            }
            PeerMessage::Extended { id, payload } => self.dispatch_extended(id, &payload)?,
        }
        Ok(())
    }

    fn dispatch_extended(&mut self, id: u8, payload: &[u8]) -> Result<()> {
        if id == 0 {
            let handshake = ExtendedHandshake::decode(payload)?;
            self.peer_extension_ids = handshake.m.clone();

            if let Some(size) = handshake.metadata_size {
                self.metadata_size = Some(size);
                let piece_count = handshake.piece_count();
                self.piece_count = Some(piece_count);
                if piece_count == 0 {
                    self.close();
                    return Ok(());
                }
                if let Some(handler) = &mut self.extended_handshake_handler {
                    handler(piece_count, size);
                }
            }
            return Ok(());
        }

        if id == UT_METADATA_LOCAL_ID {
            let (message, trailing) = UtMetadataMessage::decode(payload)?;
            match message {
                UtMetadataMessage::Data { piece, .. } => {
                    if let Some(handler) = &mut self.piece_data_handler {
                        handler(piece, trailing.to_vec());
                    }
                }
                UtMetadataMessage::Reject { piece } => {
                    debug!("peer rejected ut_metadata piece {}", piece);
                }
                UtMetadataMessage::Request { .. } => {}
            }
            return Ok(());
        }

        debug!("ignoring extended message with unknown local id {}", id);
        Ok(())
    }

    /// Issues `ut_metadata request` for every piece index in a random
    /// permutation (spec.md §4.9) and arranges for `on_piece` to be
    /// called as pieces arrive.
    pub async fn start_metadata_transfer(
        &mut self,
        on_piece: impl FnMut(u32, Vec<u8>) + Send + 'static,
    ) -> Result<()> {
        let piece_count = self.piece_count.ok_or(ErrorKind::InvalidStatus)?;
        let peer_ut_metadata_id = *self
            .peer_extension_ids
            .get("ut_metadata")
            .ok_or(ErrorKind::InvalidStatus)?;

        self.piece_data_handler = Some(Box::new(on_piece));

        let mut indices: Vec<u32> = (0..piece_count).collect();
        indices.shuffle(&mut rand::thread_rng());

        for piece in indices {
            let dict = UtMetadataMessage::Request { piece }.encode_dict()?;
            let frame = PeerMessage::Extended {
                id: peer_ut_metadata_id,
                payload: dict,
            };
            self.transport.write_all(&frame.encode()).await?;
        }
        Ok(())
    }

    /// Idempotent; closes the transport and transitions to `Disconnected`.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.transport.close();
        self.state = ConnectionState::Disconnected;
        warn!("peer connection closed");
    }
}

fn bytes_to_bits(bytes: &[u8]) -> Vec<bool> {
    bytes
        .iter()
        .flat_map(|byte| (0..8).map(move |i| (byte >> (7 - i)) & 1 == 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Result as PwResult;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct FakeTransport {
        inbound: Arc<Mutex<VecDeque<u8>>>,
        outbound: Arc<Mutex<Vec<u8>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl FakeTransport {
        fn new() -> FakeTransport {
            FakeTransport {
                inbound: Arc::new(Mutex::new(VecDeque::new())),
                outbound: Arc::new(Mutex::new(Vec::new())),
                closed: Arc::new(Mutex::new(false)),
            }
        }

        fn push_inbound(&self, bytes: &[u8]) {
            self.inbound.lock().unwrap().extend(bytes.iter().copied());
        }

        fn outbound_snapshot(&self) -> Vec<u8> {
            self.outbound.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn connect(_addr: SocketAddr) -> PwResult<FakeTransport> {
            Ok(FakeTransport::new())
        }

        async fn read(&mut self, buf: &mut [u8]) -> PwResult<usize> {
            let mut inbound = self.inbound.lock().unwrap();
            let n = inbound.len().min(buf.len());
            for (i, slot) in buf.iter_mut().take(n).enumerate() {
                *slot = inbound[i];
            }
            inbound.drain(0..n);
            Ok(n)
        }

        async fn write_all(&mut self, buf: &[u8]) -> PwResult<()> {
            self.outbound.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }

        fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn new_connection() -> (PeerConnection<FakeTransport>, FakeTransport) {
        let transport = FakeTransport::new();
        let conn = PeerConnection::new(transport.clone(), U160::random(), U160::random(), 6881);
        (conn, transport)
    }

    #[tokio::test]
    async fn start_sends_handshake_and_extended_handshake() {
        let (mut conn, transport) = new_connection();
        conn.start().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        let sent = transport.outbound_snapshot();
        assert_eq!(&sent[0..20], &Handshake::new(conn.info_hash, conn.local_id).encode()[0..20]);
        assert!(sent.len() > HANDSHAKE_LEN);
    }

    #[tokio::test]
    async fn receives_peer_handshake_then_unchoke() {
        let (mut conn, transport) = new_connection();
        conn.start().await.unwrap();

        let peer_handshake = Handshake::new(conn.info_hash, U160::random()).encode();
        transport.push_inbound(&peer_handshake);
        conn.read_once().await.unwrap();
        assert!(conn.handshake_completed);

        let unchoked = Arc::new(Mutex::new(false));
        let flag = unchoked.clone();
        conn.on_unchoke(move || {
            *flag.lock().unwrap() = true;
        });

        transport.push_inbound(&PeerMessage::Unchoke.encode());
        conn.read_once().await.unwrap();
        assert!(*unchoked.lock().unwrap());
        assert!(!conn.peer_choke);
    }

    #[tokio::test]
    async fn extended_handshake_captures_metadata_size() {
        let (mut conn, transport) = new_connection();
        conn.start().await.unwrap();
        transport.push_inbound(&Handshake::new(conn.info_hash, U160::random()).encode());
        conn.read_once().await.unwrap();

        let captured = Arc::new(Mutex::new(None));
        let flag = captured.clone();
        conn.on_extended_handshake(move |piece_count, metadata_size| {
            *flag.lock().unwrap() = Some((piece_count, metadata_size));
        });

        let mut hs = ExtendedHandshake::ours(6881);
        hs.metadata_size = Some(48 * 1024);
        let frame = PeerMessage::Extended {
            id: 0,
            payload: hs.encode().unwrap(),
        };
        transport.push_inbound(&frame.encode());
        conn.read_once().await.unwrap();

        assert_eq!(conn.piece_count, Some(3));
        assert_eq!(*captured.lock().unwrap(), Some((3, 48 * 1024)));
    }

    #[tokio::test]
    async fn partial_frame_is_completed_by_a_later_read() {
        let (mut conn, transport) = new_connection();
        conn.start().await.unwrap();
        transport.push_inbound(&Handshake::new(conn.info_hash, U160::random()).encode());
        conn.read_once().await.unwrap();

        let encoded = PeerMessage::Have { piece: 9 }.encode();
        transport.push_inbound(&encoded[0..3]);
        conn.read_once().await.unwrap();
        assert!(conn.bitfield.is_empty());

        transport.push_inbound(&encoded[3..]);
        conn.read_once().await.unwrap();
        assert_eq!(conn.bitfield.get(9), Some(&true));
    }

    #[tokio::test]
    async fn eof_closes_the_connection() {
        let (mut conn, _transport) = new_connection();
        conn.start().await.unwrap();
        conn.read_once().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn start_metadata_transfer_requests_every_piece() {
        let (mut conn, transport) = new_connection();
        conn.start().await.unwrap();
        conn.piece_count = Some(4);
        conn.peer_extension_ids.insert("ut_metadata".to_string(), 7);

        conn.start_metadata_transfer(|_, _| {}).await.unwrap();

        let sent = transport.outbound_snapshot();
        // handshake + extended handshake + 4 requests, all framed.
        let mut requested = std::collections::HashSet::new();
        let mut pos = HANDSHAKE_LEN;
        while pos < sent.len() {
            let len = BigEndian::read_u32(&sent[pos..pos + 4]) as usize;
            let body = &sent[pos + 4..pos + 4 + len];
            if body[0] == 20 && body[1] == 7 {
                let (msg, _) = UtMetadataMessage::decode(&body[2..]).unwrap();
                if let UtMetadataMessage::Request { piece } = msg {
                    requested.insert(piece);
                }
            }
            pos += 4 + len;
        }
        assert_eq!(requested, [0u32, 1, 2, 3].iter().copied().collect());
    }
}
