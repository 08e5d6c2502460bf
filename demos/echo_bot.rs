use std::error::Error;

use meower_sdk::{ChatClient, ChatSession, HandlerError, PostEvent};
use secrecy::SecretString;

fn main() -> Result<(), Box<dyn Error>> {
    let username = "REPLACE_WITH_USERNAME".to_string();
    let password = SecretString::new("REPLACE_WITH_PASSWORD".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = ChatClient::new();
        let mut session = ChatSession::login(&client, username.clone(), password).await?;
        let api = session.api();

        session
            .on_login(|account| async move {
                println!("logged in as {}", account.username);
                Ok::<_, HandlerError>(())
            })
            .on_post(move |post: PostEvent| {
                let api = api.clone();
                let username = username.clone();
                async move {
                    println!("{}: {}", post.author, post.content);
                    if post.author != username && post.content.starts_with("!echo ") {
                        let reply = post.content.trim_start_matches("!echo ");
                        api.post(reply, post.origin.as_deref()).await?;
                    }
                    Ok::<_, HandlerError>(())
                }
            })
            .on_close(|| async {
                println!("connection closed");
                Ok::<_, HandlerError>(())
            });

        session.run().await?;
        Ok::<(), Box<dyn Error>>(())
    })
}
