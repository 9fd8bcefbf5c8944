#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveType {
    Tar,
    TarGz,
}

impl ArchiveType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
        }
    }

    pub fn cache_extension(self) -> &'static str {
        match self {
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "tar" => Some(Self::Tar),
            "tar.gz" | "tgz" => Some(Self::TarGz),
            _ => None,
        }
    }

    pub fn infer_from_url(url: &str) -> Option<Self> {
        let lower = url.to_ascii_lowercase();
        let without_fragment = lower.split('#').next().unwrap_or(&lower);
        let path = without_fragment
            .split('?')
            .next()
            .unwrap_or(without_fragment);

        if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
            return Some(Self::TarGz);
        }
        if path.ends_with(".tar") {
            return Some(Self::Tar);
        }
        None
    }
}
