// Change-observer bridge: lifecycle, event delivery and native source adapters

mod emitter;
pub mod lifecycle;
pub mod manual_source;
pub mod notify_source;
pub mod observer;
pub mod sink;

pub use lifecycle::{ChangeBridge, SubscriptionState};
pub use manual_source::ManualSource;
pub use notify_source::NotifySource;
pub use observer::{NativeSignal, NotifyFn, ObserverHandle, RegistrationToken};
pub use sink::{channel, CallbackSink, ChangeSink, ChangeStream, ChannelSink, StreamItem};
