use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use vortex_http::server::HttpServer;
use vortex_web::{Application, BoxError, HandlerContext, RequestHandler};

struct MainHandler;

impl RequestHandler for MainHandler {
    fn get(&mut self, context: &mut HandlerContext) -> Result<(), BoxError> {
        context.write("worked for the first time :)\r\n");
        let name = context.argument_or("name", "default");
        context.write(format!("name is: {name}\r\n"));
        Ok(())
    }

    fn post(&mut self, context: &mut HandlerContext) -> Result<(), BoxError> {
        context.write("worked for POST too\r\n");
        Ok(())
    }
}

fn main() -> std::io::Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let application = Application::builder()
        .route("/", || MainHandler)
        .build()
        .expect("routes are valid");

    let server = HttpServer::new(Arc::new(application))?;
    server.listen(8089)
}
