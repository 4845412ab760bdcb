//! Client lifecycle on the service side: admission, client ids, and teardown
//! of everything a client owns when it goes away.

mod clients;

pub use clients::{ClientSession, ClientState, ClientTable};
