use crate::error::{Result, SessionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Комната из `/api/confInfo`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Список комнат: только источник имён для `join`
pub struct RoomDirectory {
    client: reqwest::Client,
    url: String,
}

impl RoomDirectory {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub async fn list(&self) -> Result<Vec<RoomInfo>> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_rooms(&body)
    }
}

/// Новые комнаты первыми. Пустой список сервер отдаёт как `null`.
pub fn parse_rooms(body: &str) -> Result<Vec<RoomInfo>> {
    let rooms: Option<Vec<RoomInfo>> = serde_json::from_str(body)
        .map_err(|e| SessionError::ProtocolDecode(format!("room list: {e}")))?;
    let mut rooms = rooms.unwrap_or_default();
    rooms.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    debug!("Room directory returned {} rooms", rooms.len());
    Ok(rooms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooms_are_sorted_newest_first() {
        let body = r#"[
            {"name":"old","createdAt":"2024-05-01T10:00:00.123456789+08:00"},
            {"name":"new","createdAt":"2024-05-02T09:30:00Z"}
        ]"#;
        let rooms = parse_rooms(body).unwrap();
        let names: Vec<_> = rooms.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["new", "old"]);
        assert_eq!(rooms[1].created_at.to_rfc3339(), "2024-05-01T02:00:00.123456789+00:00");
    }

    #[test]
    fn null_body_is_an_empty_list() {
        assert!(parse_rooms("null").unwrap().is_empty());
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            parse_rooms("<html>"),
            Err(SessionError::ProtocolDecode(_))
        ));
    }
}
