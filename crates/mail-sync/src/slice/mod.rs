//! Live views onto a folder and the events they emit

mod consumer;
mod mail_slice;

pub use consumer::{
    BufferedConsumer, SliceConsumer, SliceEvent, SliceFlags, SliceStatus, apply_event,
};
pub use mail_slice::{GrowDirection, MailSlice, SliceId};
