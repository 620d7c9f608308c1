use tracing::debug;

use hypideas_backend::{Backend, Filter, Query, fetch_lenient};
use hypideas_types::api::{SEARCH_LIMIT, SearchQuery};
use hypideas_types::models::{Post, Profile};

use crate::posts::POST_COLUMNS;
use crate::{Api, PROFILE_COLUMNS, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResults {
    pub users: Vec<Profile>,
    pub posts: Vec<Post>,
}

impl SearchResults {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.posts.is_empty()
    }
}

fn contains_pattern(term: &str) -> String {
    format!("*{}*", term)
}

impl<B: Backend> Api<B> {
    /// Run a search typed into the search box. See [`SearchQuery`] for the
    /// prefixes. Input too short to search on gives no results.
    pub async fn search(&self, raw: &str) -> Result<SearchResults> {
        let Some(query) = SearchQuery::parse(raw) else {
            return Ok(SearchResults::default());
        };
        let results = match &query {
            SearchQuery::Users(term) => SearchResults {
                users: self.search_users(term, SEARCH_LIMIT).await?,
                posts: Vec::new(),
            },
            SearchQuery::Posts(term) => SearchResults {
                users: Vec::new(),
                posts: self.search_posts(term, true, SEARCH_LIMIT).await?,
            },
            SearchQuery::Everything(term) => SearchResults {
                users: self.search_users(term, SEARCH_LIMIT / 2).await?,
                posts: self.search_posts(term, false, SEARCH_LIMIT / 2).await?,
            },
        };
        debug!(
            "Search '{}' found {} users, {} posts",
            query.term(),
            results.users.len(),
            results.posts.len()
        );
        Ok(results)
    }

    async fn search_users(&self, term: &str, limit: usize) -> Result<Vec<Profile>> {
        let pattern = contains_pattern(term);
        let query = Query::table("users")
            .select(PROFILE_COLUMNS)
            .or(vec![
                Filter::ilike("username", &pattern),
                Filter::ilike("display_name", &pattern),
            ])
            .order("username", true)
            .limit(limit);
        fetch_lenient(self.backend(), &query).await
    }

    /// Posts whose title or body mention `term`; with `by_tag` an exact
    /// tag match counts too.
    async fn search_posts(&self, term: &str, by_tag: bool, limit: usize) -> Result<Vec<Post>> {
        let pattern = contains_pattern(term);
        let mut alternatives = vec![
            Filter::ilike("title", &pattern),
            Filter::ilike("content", &pattern),
        ];
        if by_tag {
            alternatives.push(Filter::contains("tags", [term]));
        }
        let query = Query::table("posts")
            .select(POST_COLUMNS)
            .or(alternatives)
            .eq("is_deleted", false)
            .order("created_at", false)
            .limit(limit);
        fetch_lenient(self.backend(), &query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, user};
    use serde_json::json;
    use uuid::Uuid;

    fn seed_post(h: &Harness, author: &Profile, title: &str, content: &str, tags: &[&str], deleted: bool) {
        h.backend.seed(
            "posts",
            vec![json!({
                "id": Uuid::new_v4(),
                "user_id": author.id,
                "title": title,
                "content": content,
                "tags": tags,
                "is_deleted": deleted,
                "created_at": "2024-05-01T09:00:00Z",
            })],
        );
    }

    #[tokio::test]
    async fn at_prefix_finds_people_by_either_name() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada_l"));
        h.api(user(2, "bob"));
        let mut grace = user(3, "gh");
        grace.display_name = Some("Grace Adams".into());
        h.api(grace);

        let found = ada.search("@ada").await.unwrap();
        let names: Vec<&str> = found.users.iter().filter_map(|u| u.username.as_deref()).collect();
        assert_eq!(names, vec!["ada_l", "gh"]);
        assert!(found.posts.is_empty());
    }

    #[tokio::test]
    async fn topic_prefix_matches_text_and_tags_but_not_deleted() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        let me = ada.me().clone();
        seed_post(&h, &me, "Fusion at home", "cheap reactors", &[], false);
        seed_post(&h, &me, "Garden", "tomatoes", &["fusion"], false);
        seed_post(&h, &me, "Old fusion idea", "x", &[], true);
        seed_post(&h, &me, "Unrelated", "nothing", &[], false);

        let found = ada.search("t/fusion").await.unwrap();
        let mut titles: Vec<&str> = found.posts.iter().map(|p| p.title.as_str()).collect();
        titles.sort();
        assert_eq!(titles, vec!["Fusion at home", "Garden"]);
        assert!(found.users.is_empty());
        assert!(found.posts[0].author.is_some());
    }

    #[tokio::test]
    async fn plain_text_searches_both_without_tags() {
        let h = Harness::new();
        let ada = h.api(user(1, "ada"));
        h.api(user(2, "solar_sam"));
        let me = ada.me().clone();
        seed_post(&h, &me, "Solar roads", "panels", &[], false);
        seed_post(&h, &me, "Garden", "tomatoes", &["solar"], false);

        let found = ada.search("solar").await.unwrap();
        assert_eq!(found.users.len(), 1);
        assert_eq!(found.posts.len(), 1);
        assert_eq!(found.posts[0].title, "Solar roads");

        assert!(ada.search("s").await.unwrap().is_empty());
    }
}
