pub mod books;

pub use books::{
    AnnotationMode, BlobReleasePolicy, BookRequest, Bookshelf, PartialFailureWarning,
    WorkflowOutcome, WorkflowSettings, WorkflowStep,
};
