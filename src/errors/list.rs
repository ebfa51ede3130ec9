use std::fmt;

use super::Error;

/// Errors collected across a best-effort iteration.
///
/// Route- and filter-level failures are pushed here and the iteration carries
/// on; the caller inspects the list once the whole pass is done.
#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<Error>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: Error) {
        self.errors.push(error);
    }

    /// Record the error of `result`, if any, and hand back the success value.
    pub fn absorb<T>(&mut self, result: Result<T, Error>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.push(error);
                None
            }
        }
    }

    /// Merge the members of another list produced by a nested pass.
    pub fn absorb_list(&mut self, result: Result<(), ErrorList>) {
        if let Err(list) = result {
            self.errors.extend(list.errors);
        }
    }

    pub fn has_any(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Error> {
        self.errors.iter()
    }

    pub fn all(&self) -> &[Error] {
        &self.errors
    }

    pub fn into_vec(self) -> Vec<Error> {
        self.errors
    }

    /// Attribute every member to the given route.
    pub fn for_route(self, route: &str) -> Self {
        self.errors.into_iter().map(|error| error.for_route(route)).collect()
    }

    /// `Ok(())` when nothing was collected, the list itself otherwise.
    pub fn into_result(self) -> Result<(), ErrorList> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Pull the first fatal member out of the list.
    pub fn take_fatal(&mut self) -> Option<Error> {
        let index = self.errors.iter().position(Error::is_fatal)?;
        Some(self.errors.remove(index))
    }
}

impl From<Error> for ErrorList {
    fn from(error: Error) -> Self {
        Self { errors: vec![error] }
    }
}

impl FromIterator<Error> for ErrorList {
    fn from_iter<I: IntoIterator<Item = Error>>(iter: I) -> Self {
        Self { errors: iter.into_iter().collect() }
    }
}

impl Extend<Error> for ErrorList {
    fn extend<I: IntoIterator<Item = Error>>(&mut self, iter: I) {
        self.errors.extend(iter);
    }
}

impl IntoIterator for ErrorList {
    type Item = Error;
    type IntoIter = std::vec::IntoIter<Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, error) in self.errors.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}
