//! Wire format between the orchestrator and the eventing worker.

pub mod frame;
pub mod metadata;
pub mod opcode;
pub mod response;

pub use frame::{
    EventType, FRAME_HEADER_LEN, Frame, FramingError, NO_PARTITION, NUM_PARTITIONS, decode,
    decode_prefix, encode, encode_into,
};
pub use metadata::{DataType, EventMetadata, METADATA_VERSION, SchemaError, TimerEvent, TimerRequest};
pub use opcode::{ControlOpcode, ResponseOpcode};
pub use response::{
    AckPayload, CreateTimer, EventOutcome, ack_response, build_partition_response,
    build_response, checkpoint_response, create_timer_response, outcome_response,
    stats_response,
};
