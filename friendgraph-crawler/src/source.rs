use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::SourceError;
use crate::model::{AccountDetails, ContentItem, FetchedProfile, OwnedContent, ProfileRecord};

pub const STEAM_API_BASE: &str = "https://api.steampowered.com/";
const STEAM_MEDIA_BASE: &str = "https://media.steampowered.com/steamcommunity/public/images/apps";

/// Upstream source of profile data, queried once per discovered node.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn fetch_profile(&self, profile_id: &str) -> Result<FetchedProfile, SourceError>;
}

/// Profile source backed by the Steam Web API.
pub struct SteamSource {
    client: Client,
    api_key: String,
    base_url: String,
}

impl SteamSource {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("friendgraph/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .connect_timeout(timeout / 2)
            .pool_max_idle_per_host(50)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: STEAM_API_BASE.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        self.base_url = base_url;
        self
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, SourceError> {
        let query = std::iter::once(("key", self.api_key.as_str())).chain(params.iter().copied());
        let url = Url::parse_with_params(&format!("{}{}", self.base_url, path), query)
            .map_err(|e| SourceError::Permanent(format!("Invalid API URL for {}: {}", path, e)))?;

        debug!("GET {}", path);
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SourceError::Permanent(format!(
                "{} is private or not accessible (HTTP {})",
                path, status
            )));
        }
        let response = response.error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    async fn account_details(&self, profile_id: &str) -> Result<AccountDetails, SourceError> {
        let summaries: PlayerSummariesResponse = self
            .get_json(
                "ISteamUser/GetPlayerSummaries/v0002/",
                &[("steamids", profile_id)],
            )
            .await?;

        let player = summaries
            .response
            .players
            .into_iter()
            .find(|p| p.steamid == profile_id)
            .ok_or_else(|| {
                SourceError::Permanent(format!("profile {} does not exist", profile_id))
            })?;

        Ok(AccountDetails {
            steam_id: player.steamid,
            persona_name: player.personaname,
            profile_url: player.profileurl,
            avatar: player.avatarfull.unwrap_or(player.avatar),
            time_created: player.timecreated.unwrap_or_default(),
            country_code: player.loccountrycode,
        })
    }

    async fn friend_ids(&self, profile_id: &str) -> Result<Vec<String>, SourceError> {
        let friends: FriendListResponse = self
            .get_json(
                "ISteamUser/GetFriendList/v0001/",
                &[("steamid", profile_id), ("relationship", "friend")],
            )
            .await?;
        Ok(friends
            .friendslist
            .friends
            .into_iter()
            .map(|f| f.steamid)
            .collect())
    }

    async fn owned_games(&self, profile_id: &str) -> Result<Vec<Game>, SourceError> {
        let owned: OwnedGamesResponse = self
            .get_json(
                "IPlayerService/GetOwnedGames/v0001/",
                &[
                    ("steamid", profile_id),
                    ("include_appinfo", "1"),
                    ("include_played_free_games", "1"),
                ],
            )
            .await?;
        // Private libraries come back as an empty response object
        Ok(owned.response.games)
    }
}

#[async_trait]
impl ProfileSource for SteamSource {
    async fn fetch_profile(&self, profile_id: &str) -> Result<FetchedProfile, SourceError> {
        let details = self.account_details(profile_id).await?;
        let (friend_ids, games) =
            tokio::try_join!(self.friend_ids(profile_id), self.owned_games(profile_id))?;

        let owned = games
            .iter()
            .map(|g| OwnedContent {
                content_id: g.appid,
                usage_minutes: g.playtime_forever,
            })
            .collect();
        let content = games.into_iter().map(Game::into_content_item).collect();

        Ok(FetchedProfile {
            record: ProfileRecord {
                details,
                friend_ids,
                owned,
            },
            content,
        })
    }
}

#[derive(Deserialize)]
struct PlayerSummariesResponse {
    response: Players,
}

#[derive(Deserialize)]
struct Players {
    #[serde(default)]
    players: Vec<Player>,
}

#[derive(Deserialize)]
struct Player {
    steamid: String,
    #[serde(default)]
    personaname: String,
    #[serde(default)]
    profileurl: String,
    #[serde(default)]
    avatar: String,
    avatarfull: Option<String>,
    timecreated: Option<i64>,
    loccountrycode: Option<String>,
}

#[derive(Deserialize)]
struct FriendListResponse {
    friendslist: FriendList,
}

#[derive(Deserialize)]
struct FriendList {
    #[serde(default)]
    friends: Vec<Friend>,
}

#[derive(Deserialize)]
struct Friend {
    steamid: String,
}

#[derive(Deserialize)]
struct OwnedGamesResponse {
    response: OwnedGames,
}

#[derive(Deserialize)]
struct OwnedGames {
    #[serde(default)]
    games: Vec<Game>,
}

#[derive(Deserialize)]
struct Game {
    appid: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    playtime_forever: u64,
    #[serde(default)]
    img_icon_url: String,
    #[serde(default)]
    img_logo_url: String,
}

impl Game {
    fn into_content_item(self) -> ContentItem {
        ContentItem {
            content_id: self.appid,
            icon_url: media_url(self.appid, &self.img_icon_url),
            logo_url: media_url(self.appid, &self.img_logo_url),
            name: self.name,
        }
    }
}

fn media_url(appid: u64, hash: &str) -> String {
    if hash.is_empty() {
        String::new()
    } else {
        format!("{}/{}/{}.jpg", STEAM_MEDIA_BASE, appid, hash)
    }
}
