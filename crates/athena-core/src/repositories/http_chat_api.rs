use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::chat_api::{BoxFuture, ChatApi, ConversationDocument, FolderDocument};
use super::error::{ApiError, ApiResult};
use super::http_client::SharedHttpClient;
use crate::models::Role;

/// `{status}` acknowledgement; failures can arrive with a 2xx code
#[derive(Deserialize)]
struct StatusResponse {
    status: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationRequest<'a> {
    title: &'a str,
    user_id: &'a str,
}

#[derive(Serialize)]
struct SetPinnedRequest {
    pinned: bool,
}

#[derive(Serialize)]
struct PostMessageRequest<'a> {
    content: &'a str,
    role: Role,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateFolderRequest<'a> {
    name: &'a str,
    conversations: &'a [ConversationDocument],
    user_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RenameFolderRequest<'a> {
    new_name: &'a str,
}

/// Fail on any non-2xx status, keeping the body for the error message
async fn ensure_success(response: reqwest::Response) -> ApiResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> ApiResult<T> {
    let response = ensure_success(response).await?;
    let body = response.text().await?;
    Ok(serde_json::from_str(&body)?)
}

/// `ChatApi` over the web app's REST routes
#[derive(Clone)]
pub struct HttpChatApi {
    base_url: String,
    http: SharedHttpClient,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, http: SharedHttpClient) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl ChatApi for HttpChatApi {
    fn sync_user(&self) -> BoxFuture<'static, ApiResult<()>> {
        let url = self.url("/api/user");
        let http = self.http.clone();

        Box::pin(async move {
            let response = http.client()?.get(&url).send().await?;
            let status = response.status().as_u16();
            let ack: StatusResponse = read_json(response).await?;
            if ack.status != "ok" {
                return Err(ApiError::Status {
                    status,
                    body: format!("user sync reported status {:?}", ack.status),
                });
            }
            debug!("User synced with backend");
            Ok(())
        })
    }

    fn list_conversations(
        &self,
        user_id: &str,
    ) -> BoxFuture<'static, ApiResult<Vec<ConversationDocument>>> {
        let url = self.url(&format!("/api/chat/{}", user_id));
        let http = self.http.clone();

        Box::pin(async move {
            let response = http.client()?.get(&url).send().await?;
            read_json(response).await
        })
    }

    fn create_conversation(
        &self,
        user_id: &str,
        title: &str,
    ) -> BoxFuture<'static, ApiResult<ConversationDocument>> {
        let url = self.url("/api/chat");
        let http = self.http.clone();
        let user_id = user_id.to_string();
        let title = title.to_string();

        Box::pin(async move {
            let response = http
                .client()?
                .post(&url)
                .json(&CreateConversationRequest {
                    title: &title,
                    user_id: &user_id,
                })
                .send()
                .await?;
            read_json(response).await
        })
    }

    fn set_pinned(&self, conversation_id: &str, pinned: bool) -> BoxFuture<'static, ApiResult<()>> {
        let url = self.url(&format!("/api/chat/{}", conversation_id));
        let http = self.http.clone();

        Box::pin(async move {
            let response = http
                .client()?
                .patch(&url)
                .json(&SetPinnedRequest { pinned })
                .send()
                .await?;
            ensure_success(response).await?;
            Ok(())
        })
    }

    fn delete_conversation(&self, conversation_id: &str) -> BoxFuture<'static, ApiResult<()>> {
        let url = self.url(&format!("/api/chat/{}", conversation_id));
        let http = self.http.clone();

        Box::pin(async move {
            let response = http.client()?.delete(&url).send().await?;
            ensure_success(response).await?;
            Ok(())
        })
    }

    fn post_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> BoxFuture<'static, ApiResult<ConversationDocument>> {
        let url = self.url(&format!("/api/chat/{}/messages", conversation_id));
        let http = self.http.clone();
        let content = content.to_string();

        Box::pin(async move {
            let response = http
                .client()?
                .post(&url)
                .json(&PostMessageRequest {
                    content: &content,
                    role,
                })
                .send()
                .await?;
            read_json(response).await
        })
    }

    fn list_folders(&self, user_id: &str) -> BoxFuture<'static, ApiResult<Vec<FolderDocument>>> {
        let url = self.url(&format!("/api/folder/{}", user_id));
        let http = self.http.clone();

        Box::pin(async move {
            let response = http.client()?.get(&url).send().await?;
            read_json(response).await
        })
    }

    fn create_folder(
        &self,
        user_id: &str,
        name: &str,
        conversations: Vec<ConversationDocument>,
    ) -> BoxFuture<'static, ApiResult<FolderDocument>> {
        let url = self.url("/api/folder");
        let http = self.http.clone();
        let user_id = user_id.to_string();
        let name = name.to_string();

        Box::pin(async move {
            let response = http
                .client()?
                .post(&url)
                .json(&CreateFolderRequest {
                    name: &name,
                    conversations: &conversations,
                    user_id: &user_id,
                })
                .send()
                .await?;
            read_json(response).await
        })
    }

    fn rename_folder(&self, folder_id: &str, new_name: &str) -> BoxFuture<'static, ApiResult<()>> {
        let url = self.url(&format!("/api/folder/{}", folder_id));
        let http = self.http.clone();
        let new_name = new_name.to_string();

        Box::pin(async move {
            let response = http
                .client()?
                .patch(&url)
                .json(&RenameFolderRequest { new_name: &new_name })
                .send()
                .await?;
            ensure_success(response).await?;
            Ok(())
        })
    }

    fn delete_folder(&self, folder_id: &str) -> BoxFuture<'static, ApiResult<()>> {
        let url = self.url(&format!("/api/folder/{}", folder_id));
        let http = self.http.clone();

        Box::pin(async move {
            let response = http.client()?.delete(&url).send().await?;
            ensure_success(response).await?;
            Ok(())
        })
    }
}
