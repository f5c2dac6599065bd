//! Request fixtures shared by the parser benchmarks.

/// One benchmark input: a captured request and how it is fed to the parser.
#[derive(Debug, Copy, Clone)]
pub struct TestCase {
    name: &'static str,
    feed: Feed,
    file: TestFile,
}

impl TestCase {
    pub fn new(name: &'static str, feed: Feed, file: TestFile) -> Self {
        Self { name, feed, file }
    }

    pub fn whole(name: &'static str, file: TestFile) -> Self {
        Self::new(name, Feed::Whole, file)
    }

    pub fn fragmented(name: &'static str, file: TestFile, fragment: usize) -> Self {
        Self::new(name, Feed::Fragments(fragment), file)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn feed(&self) -> Feed {
        self.feed
    }

    pub fn file(&self) -> &TestFile {
        &self.file
    }

    pub fn file_name(&self) -> &'static str {
        self.file().file_name
    }

    /// The growing prefixes a socket would deliver, one per read.
    pub fn arrivals(&self) -> Vec<&'static [u8]> {
        let bytes = self.file.bytes();
        match self.feed {
            Feed::Whole => vec![bytes],
            Feed::Fragments(size) => {
                let size = size.max(1);
                (1..=bytes.len().div_ceil(size)).map(|n| &bytes[..(n * size).min(bytes.len())]).collect()
            }
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TestFile {
    file_name: &'static str,
    content: &'static str,
}

impl TestFile {
    pub const fn new(file_name: &'static str, content: &'static str) -> Self {
        Self { file_name, content }
    }

    pub fn content(&self) -> &'static str {
        self.content
    }

    pub fn bytes(&self) -> &'static [u8] {
        self.content.as_bytes()
    }

    pub fn file_name(&self) -> &'static str {
        self.file_name
    }
}

/// How request bytes reach the parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Feed {
    /// Everything in a single read.
    Whole,
    /// Reads of at most this many bytes.
    Fragments(usize),
}
