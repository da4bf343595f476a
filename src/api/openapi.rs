use super::handlers::{first_factor, health, logout, user_info, verify};
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApi, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

const TAGS: [(&str, &str); 5] = [
    ("health", "Service liveness and build information"),
    ("verify", "Forward-auth decisions for reverse proxies"),
    ("authentication", "First-factor login and logout"),
    ("user", "Second-factor preferences of the logged-in user"),
    ("vigil", "Forward authentication and access control"),
];

#[must_use]
pub fn openapi() -> OpenApi {
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Router whose `#[utoipa::path]` annotations also make up the `OpenAPI` document.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(package_openapi())
        .routes(routes!(health::health))
        .routes(routes!(verify::verify))
        .routes(routes!(first_factor::first_factor))
        .routes(routes!(logout::logout))
        .routes(routes!(user_info::user_info))
        .routes(routes!(user_info::set_method));

    router.get_openapi_mut().tags = Some(
        TAGS.iter()
            .map(|(name, description)| {
                let mut tag = Tag::new(*name);
                tag.description = Some((*description).to_string());
                tag
            })
            .collect(),
    );

    router
}

fn package_openapi() -> OpenApi {
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(non_empty(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = package_contact(env!("CARGO_PKG_AUTHORS"));
    info.license = non_empty(env!("CARGO_PKG_LICENSE")).map(|identifier| {
        let mut license = License::new(identifier);
        license.identifier = Some(identifier.to_string());
        license
    });

    OpenApiBuilder::new().info(info).build()
}

/// Contact from the first `;` separated Cargo author, `Name <email>` or just `Name`.
fn package_contact(authors: &str) -> Option<Contact> {
    let (name, email) = parse_author(authors.split(';').next()?);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|value| !value.is_empty())
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    match author.split_once('<') {
        Some((name, email)) => (non_empty(name), non_empty(email.trim_end().trim_end_matches('>'))),
        None => (non_empty(author), None),
    }
}
