pub mod alter;
pub mod cache;
pub mod cursor;
pub mod document;
pub mod query_spec;
pub mod schema;
pub mod smart_sql;
pub mod spec;
pub mod store;
pub mod transaction;

pub use alter::{AlterSoupDetails, AlterSoupOperation, AlterSoupStep};
pub use cursor::StoreCursor;
pub use query_spec::{Order, QuerySpec, QueryType};
pub use spec::{IndexSpec, IndexType, SoupFeature, SoupSpec};
pub use store::SmartStore;
