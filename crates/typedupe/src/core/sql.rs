//! Ordered, transaction-grouped SQL batches.

/// An ordered sequence of statement groups.
///
/// Each inner group runs as one destination transaction; groups run in order,
/// possibly across separate round trips. Statements are opaque dialect text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sql {
    transactions: Vec<Vec<String>>,
}

impl Sql {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A single statement in its own group.
    pub fn of(statement: impl Into<String>) -> Self {
        Self::transactionally([statement.into()])
    }

    /// Every statement in its own group.
    pub fn separately<I, S>(statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let transactions = statements
            .into_iter()
            .map(Into::into)
            .filter(|s: &String| !s.is_empty())
            .map(|s| vec![s])
            .collect();
        Self { transactions }
    }

    /// All statements in one group.
    pub fn transactionally<I, S>(statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let group: Vec<String> = statements
            .into_iter()
            .map(Into::into)
            .filter(|s: &String| !s.is_empty())
            .collect();
        if group.is_empty() {
            return Self::empty();
        }
        Self {
            transactions: vec![group],
        }
    }

    /// Concatenate batches, keeping group boundaries.
    pub fn concat<I>(batches: I) -> Self
    where
        I: IntoIterator<Item = Sql>,
    {
        Self {
            transactions: batches
                .into_iter()
                .flat_map(|b| b.transactions)
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn transactions(&self) -> &[Vec<String>] {
        &self.transactions
    }

    /// All statements in execution order, ignoring grouping.
    pub fn statements(&self) -> impl Iterator<Item = &str> {
        self.transactions.iter().flatten().map(String::as_str)
    }
}
