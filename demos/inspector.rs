use halfclose_web::{
    charset, mime, Handled, HttpHandler, ParsedMessage, ResponseHead, Server, StatusCode,
};
use std::{fmt::Write, time::Duration};

fn describe(message: &ParsedMessage) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "method:   {}", message.method().as_str());
    let _ = writeln!(out, "target:   {}", message.target());
    let _ = writeln!(out, "path:     {}", message.path());
    let _ = writeln!(out, "version:  {:?}", message.version());
    let _ = writeln!(out, "query:    {:?}", message.query());
    let _ = writeln!(out, "fragment: {:?}", message.fragment());
    for header in message.headers() {
        let _ = writeln!(out, "header:   {}: {}", header.name(), header.value());
    }

    out
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .init();

    let server = Server::builder()
        .port(8080)
        .handler(HttpHandler::from_fn("/", |message, packet| {
            let connection = packet.connection();

            // Bodies are echoed after the description, so allow slow uploads
            if connection.set_recv_timeout(Duration::from_secs(60)).is_err() {
                return Handled::Fail(-1);
            }
            let length = message.content_length();
            if length > 64 * 1024 {
                return Handled::Fail(-3);
            }
            let mut body = vec![0u8; length as usize];
            if connection.recv_exact(&mut body).is_err() {
                return Handled::PeerClosed;
            }

            let mut text = describe(message);
            text.push_str(&String::from_utf8_lossy(&body));

            let head = ResponseHead::new(StatusCode::Ok, 0)
                .mime(mime::TEXT)
                .charset(charset::UTF_8)
                .keep_alive(message.is_keep_alive());
            match connection.send_text(head, text.as_bytes()) {
                Ok(()) if message.is_keep_alive() => Handled::KeepAlive,
                Ok(()) => Handled::Close,
                Err(_) => Handled::Fail(-2),
            }
        }))
        .build()?;

    let reason = server.run();
    eprintln!("server stopped: {reason}");
    Ok(())
}
