//! SQL text for each [`Query`] variant
//!
//! Every value is bound, never interpolated. Category names are matched
//! either exactly (partition queries) or by an escaped `LIKE` prefix
//! (discovery and totals), both of which use the category title index.

use super::Query;
use sdk::types::Campaign;

/// A bound parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bind {
    Text(String),
    Int(i64),
}

/// Rendered SQL plus its parameters in placeholder order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub binds: Vec<Bind>,
}

const FILE_JOINS: &str = "
FROM categorylinks cl
JOIN page p ON p.page_id = cl.cl_from AND p.page_namespace = 6 AND p.page_is_redirect = 0
JOIN image i ON i.img_name = p.page_title
JOIN actor a ON a.actor_id = i.img_actor
LEFT JOIN user u ON u.user_id = a.actor_user
LEFT JOIN globalimagelinks gil ON gil.gil_to = i.img_name";

const COUNT_COLUMNS: &str = "
SELECT
    COUNT(DISTINCT i.img_name) AS uploads,
    COUNT(DISTINCT a.actor_name) AS uploaders,
    COUNT(DISTINCT CASE WHEN gil.gil_to IS NOT NULL THEN i.img_name END) AS images_used,
    COUNT(DISTINCT CASE WHEN u.user_registration BETWEEN ? AND ? THEN a.actor_name END) AS new_uploaders";

/// Escape `LIKE` metacharacters and append a trailing wildcard
pub fn like_prefix(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 8);
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

/// Render a query into SQL and binds
pub fn render(query: &Query) -> Statement {
    match query {
        Query::Discovery { campaign, year } => discovery(campaign, *year),
        Query::Partition {
            campaign,
            year,
            category,
            ..
        } => partition(campaign, *year, category),
        Query::YearTotals { campaign, year } => year_totals(campaign, *year),
        Query::Uploaders { category, .. } => uploaders(category),
        Query::DailyUploads {
            campaign,
            year,
            category,
            ..
        } => daily_uploads(campaign, *year, category),
    }
}

fn year_category_matchers(campaign: &Campaign, year: i32) -> (String, Vec<Bind>) {
    let mut clauses = Vec::new();
    let mut binds = Vec::new();
    for prefix in campaign.prefixes() {
        clauses.push("cat_title LIKE ?");
        binds.push(Bind::Text(like_prefix(&format!("{}_{}_in_", prefix, year))));
        clauses.push("cat_title = ?");
        binds.push(Bind::Text(format!("{}_{}", prefix, year)));
    }
    (clauses.join(" OR "), binds)
}

fn discovery(campaign: &Campaign, year: i32) -> Statement {
    let (matchers, binds) = year_category_matchers(campaign, year);
    Statement {
        sql: format!(
            "SELECT cat_title AS category, cat_files AS files FROM category WHERE ({}) AND cat_files > 0 ORDER BY cat_title",
            matchers
        ),
        binds,
    }
}

fn window_binds(campaign: &Campaign, year: i32) -> Vec<Bind> {
    let (start, end) = campaign.window(year);
    vec![Bind::Text(start), Bind::Text(end)]
}

fn partition(campaign: &Campaign, year: i32, category: &str) -> Statement {
    let mut binds = window_binds(campaign, year);
    binds.push(Bind::Text(category.to_string()));
    Statement {
        sql: format!(
            "{}{}\nWHERE cl.cl_type = 'file' AND cl.cl_to = ?",
            COUNT_COLUMNS, FILE_JOINS
        ),
        binds,
    }
}

fn year_totals(campaign: &Campaign, year: i32) -> Statement {
    let mut binds = window_binds(campaign, year);
    binds.push(Bind::Int(i64::from(year)));
    let (matchers, matcher_binds) = year_category_matchers(campaign, year);
    binds.extend(matcher_binds);
    Statement {
        sql: format!(
            "{},\n    ? AS year{}\nWHERE cl.cl_type = 'file' AND cl.cl_to IN (SELECT cat_title FROM category WHERE ({}))",
            COUNT_COLUMNS, FILE_JOINS, matchers
        ),
        binds,
    }
}

fn uploaders(category: &str) -> Statement {
    Statement {
        sql: format!(
            "SELECT
    a.actor_name AS username,
    COUNT(DISTINCT i.img_name) AS uploads,
    COUNT(DISTINCT CASE WHEN gil.gil_to IS NOT NULL THEN i.img_name END) AS images_used,
    u.user_registration AS registration{}
WHERE cl.cl_type = 'file' AND cl.cl_to = ?
GROUP BY a.actor_name, u.user_registration
ORDER BY uploads DESC",
            FILE_JOINS
        ),
        binds: vec![Bind::Text(category.to_string())],
    }
}

fn daily_uploads(campaign: &Campaign, year: i32, category: &str) -> Statement {
    let mut binds = window_binds(campaign, year);
    binds.push(Bind::Text(category.to_string()));
    Statement {
        sql: format!(
            "SELECT
    CONCAT(SUBSTR(i.img_timestamp, 1, 4), '-', SUBSTR(i.img_timestamp, 5, 2), '-', SUBSTR(i.img_timestamp, 7, 2)) AS day,
    COUNT(DISTINCT i.img_name) AS uploads,
    COUNT(DISTINCT a.actor_name) AS uploaders,
    COUNT(DISTINCT CASE WHEN u.user_registration BETWEEN ? AND ? THEN a.actor_name END) AS new_uploaders{}
WHERE cl.cl_type = 'file' AND cl.cl_to = ?
GROUP BY day
ORDER BY day",
            FILE_JOINS
        ),
        binds,
    }
}
