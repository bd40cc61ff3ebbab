/// The lifecycle stage of a peer session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// The session hasn't started yet.
    Disconnected,
    /// The TCP connection is being established.
    Connecting,
    /// The handshakes are being exchanged.
    Handshaking,
    /// The handshake is done but the bitfield hasn't been exchanged yet.
    /// The bitfield is only legal in this stage, right after the
    /// handshake.
    AvailabilityExchange,
    /// The normal message flow. Nearly the whole session is spent here.
    Connected,
    /// The session is being torn down, cleanly or due to an error.
    Disconnecting,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// The protocol state of a session: where in the lifecycle it is, plus the
/// four choke/interest flags, two per direction.
///
/// Sessions start choked and not interested in both directions, per the
/// protocol.
#[derive(Clone, Copy, Debug)]
pub struct SessionState {
    /// The connection lifecycle stage.
    pub connection: ConnectionState,
    /// Whether the peer is choking us. While choked, our requests are
    /// ignored, so none are sent.
    pub is_choked: bool,
    /// Whether we are interested in at least one piece the peer has.
    pub is_interested: bool,
    /// Whether we are choking the peer. While we choke, the peer's
    /// requests are ignored.
    pub is_peer_choked: bool,
    /// Whether the peer is interested in something we have.
    pub is_peer_interested: bool,
    /// Set when the torrent has so few pieces missing that outstanding
    /// blocks are requested from several peers at once.
    pub in_endgame: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            connection: ConnectionState::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            in_endgame: false,
        }
    }
}
