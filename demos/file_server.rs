use halfclose_web::{
    mime, Handled, Handler, HandlerPacket, HttpHandler, ParsedMessage, ResponseHead, Server,
    StatusCode,
};
use std::path::PathBuf;

struct Files {
    root: PathBuf,
}

impl Handler for Files {
    fn handle(&self, message: &ParsedMessage, packet: &HandlerPacket<'_>) -> Handled {
        let name = &message.path()[packet.route().len()..];
        let mut head = ResponseHead::new(StatusCode::Ok, 0)
            .mime(mime::OCTET_STREAM)
            .keep_alive(message.is_keep_alive());
        if message.query_value("download").is_some() {
            head = head.download(name);
        }

        match packet.connection().send_file(self.root.join(name), head) {
            Ok(_) if message.is_keep_alive() => Handled::KeepAlive,
            Ok(_) => Handled::Close,
            Err(_) => Handled::Fail(-1),
        }
    }
}

struct Uploads {
    dir: String,
}

impl Handler for Uploads {
    fn handle(&self, message: &ParsedMessage, packet: &HandlerPacket<'_>) -> Handled {
        let name = message.query_value("name").unwrap_or_default();
        let size = message.content_length() as i64;

        match packet.connection().receive_file(&self.dir, name, size, true) {
            Ok(_) => Handled::KeepAlive,
            Err(_) => Handled::Fail(-2),
        }
    }
}

// curl http://127.0.0.1:8080/files/notes.txt?download
// curl --data-binary @notes.txt "http://127.0.0.1:8080/upload?name=notes.txt"
// curl http://127.0.0.1:8080/bye
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let server = Server::builder()
        .port(8080)
        .route("/files/", Files { root: "./public".into() })
        .route("/upload", Uploads { dir: "./uploads/".into() })
        .handler(HttpHandler::from_fn("/bye", |message, packet| {
            let head = ResponseHead::new(StatusCode::Ok, 0)
                .mime(mime::TEXT)
                .keep_alive(false);

            match packet.connection().send_text(head, message.path().as_bytes()) {
                Ok(()) => Handled::Close,
                Err(_) => Handled::Fail(-3),
            }
        }))
        .build()?;

    let reason = server.run();
    eprintln!("server stopped: {reason}");
    Ok(())
}
