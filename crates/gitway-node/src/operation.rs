//! Mapping requests to git operations.

use axum::http::Method;
use gitway_git::GitService;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use thiserror::Error;

/// `<repo>.git/<action>`, where the repository may sit in nested groups.
static GIT_ROUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^/(?P<repo>(?:[^/]+/)*[^/]+\.git)/(?P<action>info/refs|git-upload-pack|git-receive-pack|ssh-upload-pack|ssh-receive-pack)$",
    )
    .expect("Invalid regex")
});

/// A git operation the proxy relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// `GET info/refs?service=...`
    InfoRefs(GitService),
    /// `POST git-upload-pack`: stateless fetch.
    UploadPack,
    /// `POST git-receive-pack`: stateless push.
    ReceivePack,
    /// `POST ssh-upload-pack`: full-duplex fetch for an SSH front end.
    SshUploadPack,
    /// `POST ssh-receive-pack`: full-duplex push for an SSH front end.
    SshReceivePack,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Self::InfoRefs(GitService::UploadPack) => "info-refs-upload-pack",
            Self::InfoRefs(GitService::ReceivePack) => "info-refs-receive-pack",
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
            Self::SshUploadPack => "ssh-upload-pack",
            Self::SshReceivePack => "ssh-receive-pack",
        }
    }

    pub fn service(self) -> GitService {
        match self {
            Self::InfoRefs(service) => service,
            Self::UploadPack | Self::SshUploadPack => GitService::UploadPack,
            Self::ReceivePack | Self::SshReceivePack => GitService::ReceivePack,
        }
    }

    /// Reading the request and writing the response overlap.
    pub fn is_full_duplex(self) -> bool {
        matches!(self, Self::SshUploadPack | Self::SshReceivePack)
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::InfoRefs(service) => service.advertisement_content_type(),
            other => other.service().result_content_type(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a request is not a git operation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    BadRequest(String),
}

/// A request resolved to an operation on a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Path relative to the storage root, e.g. `group/project.git`.
    pub repo_path: String,
    pub operation: Operation,
}

impl Route {
    /// Selects the operation for a request.
    pub fn select(
        method: &Method,
        path: &str,
        query: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<Self, RouteError> {
        if is_traversal(path) {
            return Err(RouteError::BadRequest("invalid repository path".to_string()));
        }

        let captures = GIT_ROUTE.captures(path).ok_or(RouteError::NotFound)?;
        let repo_path = captures["repo"].to_string();

        let operation = match &captures["action"] {
            "info/refs" => {
                if *method != Method::GET {
                    return Err(RouteError::NotFound);
                }
                let service = query
                    .and_then(|q| query_param(q, "service"))
                    .ok_or_else(|| RouteError::Forbidden("service parameter missing".to_string()))?;
                let service = GitService::from_name(service)
                    .map_err(|_| RouteError::Forbidden(format!("unsupported service {:?}", service)))?;
                Operation::InfoRefs(service)
            }
            "git-upload-pack" => Operation::UploadPack,
            "git-receive-pack" => Operation::ReceivePack,
            "ssh-upload-pack" => Operation::SshUploadPack,
            "ssh-receive-pack" => Operation::SshReceivePack,
            _ => return Err(RouteError::NotFound),
        };

        if !matches!(operation, Operation::InfoRefs(_)) {
            if *method != Method::POST {
                return Err(RouteError::NotFound);
            }
            let expected = operation.service().request_content_type();
            if media_type(content_type) != Some(expected) {
                return Err(RouteError::NotFound);
            }
        }

        Ok(Self {
            repo_path,
            operation,
        })
    }
}

fn is_traversal(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.contains("%2e%2e")
        || lower.contains("%2f")
        || path.split('/').any(|segment| segment == ".." || segment == ".")
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| match pair.split_once('=') {
        Some((key, value)) if key == name => Some(value),
        _ => None,
    })
}

/// The media type without parameters.
fn media_type(content_type: Option<&str>) -> Option<&str> {
    content_type.map(|ct| ct.split(';').next().unwrap_or(ct).trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const UPLOAD_REQUEST: Option<&str> = Some("application/x-git-upload-pack-request");
    const RECEIVE_REQUEST: Option<&str> = Some("application/x-git-receive-pack-request");

    fn get(path: &str, query: Option<&str>) -> Result<Route, RouteError> {
        Route::select(&Method::GET, path, query, None)
    }

    fn post(path: &str, content_type: Option<&str>) -> Result<Route, RouteError> {
        Route::select(&Method::POST, path, None, content_type)
    }

    #[test]
    fn test_info_refs() {
        let route = get("/group/project.git/info/refs", Some("service=git-upload-pack")).unwrap();
        assert_eq!(route.repo_path, "group/project.git");
        assert_eq!(route.operation, Operation::InfoRefs(GitService::UploadPack));

        let route = get("/project.git/info/refs", Some("foo=1&service=git-receive-pack")).unwrap();
        assert_eq!(route.operation, Operation::InfoRefs(GitService::ReceivePack));
    }

    #[test]
    fn test_info_refs_service_required() {
        assert!(matches!(
            get("/project.git/info/refs", None),
            Err(RouteError::Forbidden(_))
        ));
        assert!(matches!(
            get("/project.git/info/refs", Some("service=git-upload-archive")),
            Err(RouteError::Forbidden(_))
        ));
    }

    #[test]
    fn test_pack_operations() {
        let route = post("/a/b/c/project.git/git-upload-pack", UPLOAD_REQUEST).unwrap();
        assert_eq!(route.repo_path, "a/b/c/project.git");
        assert_eq!(route.operation, Operation::UploadPack);

        let route = post("/project.git/git-receive-pack", RECEIVE_REQUEST).unwrap();
        assert_eq!(route.operation, Operation::ReceivePack);

        let route = post("/project.git/ssh-upload-pack", UPLOAD_REQUEST).unwrap();
        assert_eq!(route.operation, Operation::SshUploadPack);
        assert!(route.operation.is_full_duplex());

        let route = post("/project.git/ssh-receive-pack", RECEIVE_REQUEST).unwrap();
        assert_eq!(route.operation, Operation::SshReceivePack);
    }

    #[test]
    fn test_wiki_and_snippet_repositories() {
        let route = post("/group/project.wiki.git/git-upload-pack", UPLOAD_REQUEST).unwrap();
        assert_eq!(route.repo_path, "group/project.wiki.git");

        let route = get("/snippets/42.git/info/refs", Some("service=git-upload-pack")).unwrap();
        assert_eq!(route.repo_path, "snippets/42.git");
    }

    #[test]
    fn test_content_type_must_match() {
        assert_eq!(
            post("/project.git/git-upload-pack", RECEIVE_REQUEST),
            Err(RouteError::NotFound)
        );
        assert_eq!(
            post("/project.git/git-upload-pack", None),
            Err(RouteError::NotFound)
        );
        assert!(post(
            "/project.git/git-upload-pack",
            Some("application/x-git-upload-pack-request; charset=binary")
        )
        .is_ok());
    }

    #[test]
    fn test_wrong_method() {
        assert_eq!(
            Route::select(&Method::GET, "/project.git/git-upload-pack", None, UPLOAD_REQUEST),
            Err(RouteError::NotFound)
        );
        assert_eq!(
            Route::select(
                &Method::POST,
                "/project.git/info/refs",
                Some("service=git-upload-pack"),
                None
            ),
            Err(RouteError::NotFound)
        );
    }

    #[test]
    fn test_not_git_paths() {
        assert_eq!(post("/project/git-upload-pack", UPLOAD_REQUEST), Err(RouteError::NotFound));
        assert_eq!(post("/.git/git-upload-pack", UPLOAD_REQUEST), Err(RouteError::NotFound));
        assert_eq!(post("/project.git/objects/pack", UPLOAD_REQUEST), Err(RouteError::NotFound));
        assert_eq!(get("/health", None), Err(RouteError::NotFound));
    }

    #[test]
    fn test_traversal_rejected() {
        assert!(matches!(
            post("/group/../secret.git/git-upload-pack", UPLOAD_REQUEST),
            Err(RouteError::BadRequest(_))
        ));
        assert!(matches!(
            post("/group/%2E%2E/secret.git/git-upload-pack", UPLOAD_REQUEST),
            Err(RouteError::BadRequest(_))
        ));
        assert!(matches!(
            post("/./project.git/git-upload-pack", UPLOAD_REQUEST),
            Err(RouteError::BadRequest(_))
        ));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(
            Operation::InfoRefs(GitService::ReceivePack).content_type(),
            "application/x-git-receive-pack-advertisement"
        );
        assert_eq!(
            Operation::SshUploadPack.content_type(),
            "application/x-git-upload-pack-result"
        );
    }

    proptest! {
        #[test]
        fn test_selected_repo_is_a_clean_git_path(path in "(/[a-z.%0-9]{1,8}){1,4}\\.git/git-upload-pack") {
            if let Ok(route) = post(&path, UPLOAD_REQUEST) {
                prop_assert!(route.repo_path.ends_with(".git"));
                prop_assert!(!route.repo_path.split('/').any(|s| s == ".." || s == "." || s.is_empty()));
            }
        }
    }
}
