mod application;
mod error;
mod handler;

pub use application::Application;
pub use application::ApplicationBuildError;
pub use application::ApplicationBuilder;
pub use error::HttpError;
pub use handler::HandlerContext;
pub use handler::RequestHandler;
pub use vortex_http::reactor::BoxError;
