pub mod aggregator;
pub mod bus;
pub mod frame;
pub mod packet;
pub mod subscriber;

pub use aggregator::FrameAggregator;
pub use bus::{AudioBus, BusStats, SubscriptionGuard};
pub use frame::{encode_wire_frame, AudioFrame, AudioType, BINARY_FRAME_HEADER_SIZE};
pub use packet::{LineDecoder, WorkerPacket, MAX_LINE_LENGTH};
pub use subscriber::{Delivery, Subscriber, SubscriberFilter};
