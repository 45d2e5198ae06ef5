pub mod edge;
pub mod interaction;
pub mod member;
pub mod message;
pub mod pair;
pub mod segment;

pub use edge::DirectedEdge;
pub use interaction::{Direction, InteractionEvent, InteractionKind};
pub use member::{Member, MemberRelationshipEntry};
pub use message::{ChatMessage, IncomingMessage, IncomingReaction};
pub use pair::UndirectedPair;
pub use segment::{ConversationSegment, SegmentFeatures};
