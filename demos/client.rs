use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tungstenite::Message;

#[tokio::main]
async fn main() {
    // Change to your server's address
    let (mut ws_stream, _) = connect_async("ws://127.0.0.1:8080/?user_id=demo")
        .await
        .expect("Failed to connect");

    let frame = Message::Text(r#"{"content":"Hello, chat relay!"}"#.to_string());
    ws_stream.send(frame).await.expect("Failed to send message");
    println!("Message sent to the server.");

    // Print the welcome frame and the responder's reply.
    for _ in 0..2 {
        if let Some(Ok(Message::Text(text))) = ws_stream.next().await {
            println!("<- {}", text);
        }
    }
}
