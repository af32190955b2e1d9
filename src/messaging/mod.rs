//! Message bus subsystem
//!
//! The data model ([`message`]), per-agent bounded queues ([`inbox`]), the
//! terminal store for undeliverable traffic ([`dead_letter`]), and the bus
//! itself ([`bus`]).

pub mod bus;
pub mod dead_letter;
pub mod inbox;
pub mod message;

pub use bus::{BusError, Delivery, MessageBus, SendReceipt};
pub use dead_letter::{DeadLetter, DeadLetterQueue, DeadLetterStats};
pub use inbox::{AgentInbox, PushError};
pub use message::{
    AckOutcome, AckPolicy, Address, DeadLetterReason, DeliveryStatus, Message, MessageDraft,
    MessageKind, MessagePriority, Payload, RejectReason, Sender,
};
