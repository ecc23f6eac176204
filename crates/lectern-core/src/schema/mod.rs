//! Collection schemas and the row/document adapter

mod adapter;
pub mod registry;

pub use adapter::{carry_local_only, document_to_row, row_to_document, Row, SchemaError};
pub use registry::{
    collection, CollectionSchema, Coercion, FieldRule, FieldSpec, Scope, WindowSpec, WritePolicy,
    COLLECTIONS,
};
