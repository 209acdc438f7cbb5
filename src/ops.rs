//! Operation catalogue: endpoint identifiers and the feature-flag bags the
//! remote requires on every query. When the remote rotates operation ids or
//! grows the flag set, only this table changes.

use serde_json::{json, Value};

/// Public guest-tier bearer carried on every request.
pub const BEARER_TOKEN: &str = "Bearer AAAAAAAAAAAAAAAAAAAAANRILgAAAAAAnNwIzUejRCOuH5E6I8xnZz4puTs%3D1Zv7ttfk8LF81IUq16cHjhLTvJu4FA33AGWWjCpTnA";

pub const GQL_URL: &str = "https://x.com/i/api/graphql";
pub const LOGIN_URL: &str = "https://api.x.com/1.1/onboarding/task.json";
pub const GUEST_ACTIVATE_URL: &str = "https://api.x.com/1.1/guest/activate.json";

/// One remote query kind: opaque id plus its stable human-readable name.
/// The name doubles as the per-account lease key ("queue").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Op {
    pub id: &'static str,
    pub name: &'static str,
}

impl Op {
    pub fn url(&self) -> String {
        format!("{}/{}/{}", GQL_URL, self.id, self.name)
    }

    /// Request path without host, as signed into the challenge token.
    pub fn path(&self) -> String {
        format!("/i/api/graphql/{}/{}", self.id, self.name)
    }
}

pub const SEARCH_TIMELINE: Op = Op { id: "L1VfBERtzc3VkBBT0YAYHA", name: "SearchTimeline" };
pub const USER_BY_REST_ID: Op = Op { id: "Lxg1V9AiIzzXEiP2c8dRnw", name: "UserByRestId" };
pub const USER_BY_SCREEN_NAME: Op = Op { id: "oUZZZ8Oddwxs8Cd3iW3UEA", name: "UserByScreenName" };
pub const TWEET_DETAIL: Op = Op { id: "NmCeCgkVlsRGS1cAwqtgmw", name: "TweetDetail" };
pub const FOLLOWERS: Op = Op { id: "FKV1jfu4AawGapl2KCZbQw", name: "Followers" };
pub const FOLLOWING: Op = Op { id: "sKlU5dd_nanz9P2CxBt2sg", name: "Following" };
pub const RETWEETERS: Op = Op { id: "Gnw_Swm60cS-biSLn2OWNw", name: "Retweeters" };
pub const FAVORITERS: Op = Op { id: "rUyh8HWk8IXv_fvVKj3QjA", name: "Favoriters" };
pub const USER_TWEETS: Op = Op { id: "x8SpjuBpqoww-edf0aUUKA", name: "UserTweets" };
pub const USER_TWEETS_AND_REPLIES: Op =
    Op { id: "RB2KVuVBRZe4GW8KkoVF2A", name: "UserTweetsAndReplies" };
pub const LIST_LATEST_TWEETS_TIMELINE: Op =
    Op { id: "2Vjeyo_L0nizAUhHe3fKyA", name: "ListLatestTweetsTimeline" };

/// Queues whose requests must carry the article-suppression field toggles.
pub const FIELD_TOGGLE_QUEUES: &[&str] = &["SearchTimeline", "ListLatestTweetsTimeline"];

pub fn field_toggles() -> Value {
    json!({
        "withArticleRichContentState": false,
        "withArticlePlainText": false,
    })
}

/// Flag bag shared by every GraphQL query. The remote rejects requests
/// missing a required flag with error 336; that surfaces as a fatal error
/// so the operator updates this table.
pub fn gql_features() -> Value {
    json!({
        "blue_business_profile_image_shape_enabled": true,
        "responsive_web_graphql_exclude_directive_enabled": true,
        "verified_phone_label_enabled": false,
        "responsive_web_graphql_skip_user_profile_image_extensions_enabled": false,
        "responsive_web_graphql_timeline_navigation_enabled": true,
        "tweetypie_unmention_optimization_enabled": true,
        "vibe_api_enabled": true,
        "responsive_web_edit_tweet_api_enabled": true,
        "graphql_is_translatable_rweb_tweet_is_translatable_enabled": true,
        "view_counts_everywhere_api_enabled": true,
        "longform_notetweets_consumption_enabled": true,
        "tweet_awards_web_tipping_enabled": false,
        "freedom_of_speech_not_reach_fetch_enabled": true,
        "standardized_nudges_misinfo": true,
        "tweet_with_visibility_results_prefer_gql_limited_actions_policy_enabled": false,
        "interactive_text_enabled": true,
        "responsive_web_text_conversations_enabled": false,
        "longform_notetweets_rich_text_read_enabled": true,
        "longform_notetweets_inline_media_enabled": true,
        "responsive_web_enhance_cards_enabled": false,
        "creator_subscriptions_tweet_preview_api_enabled": true,
        "responsive_web_media_download_video_enabled": false,
        "rweb_lists_timeline_redesign_enabled": true,
        "responsive_web_twitter_article_tweet_consumption_enabled": false,
    })
}

/// Extra flags the user-lookup operations require on top of the shared bag.
pub fn user_extra_features() -> Value {
    json!({
        "hidden_profile_likes_enabled": true,
        "hidden_profile_subscriptions_enabled": true,
        "highlights_tweets_tab_ui_enabled": true,
        "subscriptions_verification_info_verified_since_enabled": true,
    })
}
