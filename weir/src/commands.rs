// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use codec::{
    ConnectAckPacket, ConnectPacket, PacketId, PublishPacket, SubscribeAckPacket, SubscribePacket,
    UnsubscribePacket,
};

use crate::session::InflightDelivery;
use crate::types::{LastWill, SessionGid, SessionId};

/// State a session hands back to the broker when its connection ends.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// True if the client sent a Disconnect packet before the stream closed.
    ///
    /// A graceful disconnect suppresses the will message.
    pub graceful: bool,

    /// Outbound QoS 1/2 deliveries which have not reached their terminal
    /// acknowledgment. They are stashed in the session record of a persistent
    /// session and retransmitted on reconnect.
    pub inflight: Vec<InflightDelivery>,
}

#[derive(Debug, Clone)]
pub enum SessionToListenerCmd {
    Connect(SessionId, ConnectPacket),
    Publish(SessionId, PublishPacket),
    Subscribe(SessionId, SubscribePacket),
    Unsubscribe(SessionId, UnsubscribePacket),

    /// Retry budget exhausted or no packet identifier was available for an
    /// outbound delivery.
    DeliveryFailed(SessionId, PacketId),

    Disconnect(SessionId, SessionSnapshot),
}

#[derive(Debug, Clone)]
pub enum ListenerToSessionCmd {
    /// Accepted or not, with stashed inflight deliveries to resend when a
    /// persistent session is resumed.
    ConnectAck(ConnectAckPacket, Vec<InflightDelivery>),

    Publish(PublishPacket),

    SubscribeAck(SubscribeAckPacket),

    Disconnect,
}

#[derive(Debug, Clone)]
pub enum ListenerToDispatcherCmd {
    /// Authenticated connect request.
    SessionConnected {
        gid: SessionGid,
        client_id: String,
        clean_session: bool,
        will: Option<LastWill>,
    },

    Publish(SessionGid, PublishPacket),
    Subscribe(SessionGid, SubscribePacket),
    Unsubscribe(SessionGid, UnsubscribePacket),

    DeliveryFailed(SessionGid, PacketId),

    SessionClosed(SessionGid, SessionSnapshot),
}

#[derive(Debug, Clone)]
pub enum DispatcherToListenerCmd {
    ConnectAck(SessionId, ConnectAckPacket, Vec<InflightDelivery>),
    Publish(SessionId, PublishPacket),
    SubscribeAck(SessionId, SubscribeAckPacket),

    /// Another connection, possibly on a different listener, took over this
    /// client id.
    Disconnect(SessionId),
}

#[derive(Debug, Clone)]
pub enum ListenerToAuthCmd {
    /// session-gid, username, password
    RequestAuth(SessionGid, String, Vec<u8>),
}

#[derive(Debug, Clone)]
pub enum AuthToListenerCmd {
    /// session-id, access-granted
    ResponseAuth(SessionId, bool),
}

#[derive(Debug, Clone)]
pub enum DispatcherToMetricsCmd {
    SessionAdded,
    SessionRemoved,

    /// count
    SubscriptionsAdded(usize),
    /// count
    SubscriptionsRemoved(usize),

    /// count, bytes
    RetainedMessageAdded(usize, usize),
    /// count, bytes
    RetainedMessageRemoved(usize, usize),

    /// count, bytes
    PublishPacketSent(usize, usize),
    /// count, bytes
    PublishPacketReceived(usize, usize),
    /// count, bytes
    PublishPacketDropped(usize, usize),
}
