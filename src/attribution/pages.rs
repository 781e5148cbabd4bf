//! Landing page categories for journey analysis

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageCategory {
    Pricing,
    Product,
    Education,
    Content,
    Homepage,
    About,
    Checkout,
    Other,
}

/// Path fragments per category, checked in this order
const RULES: &[(PageCategory, &[&str])] = &[
    (PageCategory::Checkout, &["checkout", "cart", "payment", "order", "purchase", "thank"]),
    (PageCategory::Pricing, &["pricing", "plans", "price"]),
    (PageCategory::Product, &["product", "features", "shop", "store", "item", "demo"]),
    (PageCategory::Education, &["learn", "guide", "course", "tutorial", "docs", "academy", "webinar", "how-to"]),
    (PageCategory::Content, &["blog", "article", "news", "post", "resources", "stories"]),
    (PageCategory::About, &["about", "team", "contact", "company", "careers"]),
];

impl PageCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageCategory::Pricing => "pricing",
            PageCategory::Product => "product",
            PageCategory::Education => "education",
            PageCategory::Content => "content",
            PageCategory::Homepage => "homepage",
            PageCategory::About => "about",
            PageCategory::Checkout => "checkout",
            PageCategory::Other => "other",
        }
    }

    /// Classify a normalized `host/path` page (or a bare path)
    pub fn classify(page: &str) -> Self {
        let path = match page.find('/') {
            Some(idx) => &page[idx..],
            None => "",
        };
        let path = path.to_lowercase();
        let path = path.trim_end_matches('/');

        if path.is_empty() {
            return PageCategory::Homepage;
        }

        RULES
            .iter()
            .find(|(_, needles)| needles.iter().any(|n| path.contains(n)))
            .map(|(category, _)| *category)
            .unwrap_or(PageCategory::Other)
    }
}

impl std::fmt::Display for PageCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
