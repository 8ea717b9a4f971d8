pub mod dispatcher;
pub mod shape;

pub use dispatcher::Dispatcher;
pub use shape::{FeedState, get_shape};
