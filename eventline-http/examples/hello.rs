//! Loopback round trip: serve a greeting and fetch it back, all on one
//! event loop.

use std::future::Future;

use eventline::{EventLoop, StopToken};
use eventline_http::{
    body, BoxBody, HttpClient, HttpClientConfig, HttpError, HttpHandler, HttpServer,
    HttpServerConfig, Request, Response,
};

struct Greeter;

impl HttpHandler for Greeter {
    fn handle(
        &self,
        request: Request,
        _stop: StopToken,
    ) -> impl Future<Output = Result<Response<BoxBody>, HttpError>> + 'static {
        async move {
            println!("serving {} {}", request.method, request.url);
            Ok(Response::new(200)
                .with_header("content-type", "text/plain")
                .with_body(body::body_from_chunks(["hello ", "from eventline"])))
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let event_loop = EventLoop::new()?;

    let server = HttpServer::serve(
        &event_loop,
        &HttpServerConfig {
            address: "127.0.0.1".to_string(),
            port: 0,
        },
        Greeter,
    )?;
    let port = server.local_addr().port();

    let handle = event_loop.clone();
    event_loop.spawn(async move {
        let client = HttpClient::new(&handle, HttpClientConfig::default());
        let mut response = client
            .fetch(
                Request::get(format!("http://127.0.0.1:{port}/")),
                StopToken::never(),
            )
            .await
            .expect("fetch failed");

        println!("status: {}", response.status);
        let mut collected = Vec::new();
        while let Some(chunk) = response.body.next_chunk().await.expect("body failed") {
            collected.extend_from_slice(&chunk);
        }
        println!("body: {}", String::from_utf8_lossy(&collected));

        server.quit().await;
    });

    event_loop.run()?;
    Ok(())
}
