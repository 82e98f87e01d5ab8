pub mod decoder;
pub mod protocol;
pub mod source;


pub use decoder::{Column, PgOutputDecoder, PgOutputMessage, Relation, RowChange};
pub use source::PostgresSource;
