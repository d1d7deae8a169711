pub mod domain;
pub mod extraction;
pub mod incident;
pub mod ports;
pub mod redaction;

pub use domain::{
    Conversation, ConversationStatus, EditHistoryEntry, FieldChange, FunctionOfBehavior, Incident,
    IncidentFields, IncidentStatus, Message, MessageRole, Student, User,
};
pub use extraction::{merge_into_patch, ExtractionSignal, MergeOutcome};
pub use incident::{IncidentError, IncidentPatch, SignatureRequest};
pub use ports::{
    FieldExtractionService, IncidentStore, NewEditHistoryEntry, PortError, PortResult,
};
pub use redaction::{redact, RedactionError, REDACTION_PLACEHOLDER};
