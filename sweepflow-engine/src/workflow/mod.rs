pub mod error;
pub mod models;
pub mod parser;

pub use error::{ParseError, ParseErrorKind};
pub use models::{
    InputFile, NodeFile, OutputFile, SinkFile, SinkOutputFile, StepFile, SubstitutionFile,
    SweepFile, WorkflowFile,
};
pub use parser::{SinkPlan, WorkflowDefinition, WorkflowParser};
