// src/core/protocol/mod.rs

pub mod alien;
pub mod hsl;
pub mod mqtt;
pub mod resp_frame;
pub mod transfer;
pub mod websocket;

pub use alien::{AlienLoginPacket, LoginStatus};
pub use hsl::{HslMessage, HslPacket, SelfCheckProtocol};
pub use mqtt::MqttMessage;
pub use resp_frame::{RespFrame, RespFrameCodec, RespReplyCodec};
pub use transfer::{FileTransfer, FileTransferDescriptor, PayloadCipher, TransferSource};
pub use websocket::{WebSocketCodec, WebSocketFrame, WebSocketMessage};
