use anyhow::Result;
use rand::{thread_rng, Rng};
use std::collections::HashMap;
use tracing::debug;

/// Fixed pool of user agents with per-domain rotation
pub struct UserAgentPool {
    agents: Vec<String>,

    /// Index of the agent last handed out for each domain
    last_by_domain: HashMap<String, usize>,
}

impl UserAgentPool {
    pub fn new(agents: Vec<String>) -> Result<Self> {
        if agents.is_empty() {
            anyhow::bail!("User agent pool cannot be empty");
        }

        Ok(Self {
            agents,
            last_by_domain: HashMap::new(),
        })
    }

    /// Pick a random agent for `domain`, never the one it got last time.
    ///
    /// Two different domains may well receive the same agent.
    pub fn get_agent_for_domain(&mut self, domain: &str) -> String {
        let mut rng = thread_rng();
        let last = self.last_by_domain.get(domain).copied();

        let index = match last {
            Some(last) if self.agents.len() > 1 => {
                // Draw from the remaining n-1 slots and skip over the last one
                let pick = rng.gen_range(0..self.agents.len() - 1);
                if pick >= last {
                    pick + 1
                } else {
                    pick
                }
            }
            _ => rng.gen_range(0..self.agents.len()),
        };

        self.last_by_domain.insert(domain.to_string(), index);
        debug!("Assigned user agent #{} to {}", index, domain);

        self.agents[index].clone()
    }

    /// Random agent with no domain affinity
    pub fn random_agent(&self) -> String {
        let mut rng = thread_rng();
        self.agents[rng.gen_range(0..self.agents.len())].clone()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agents(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("agent-{}", i)).collect()
    }

    #[test]
    fn test_no_immediate_repeat_per_domain() {
        let mut pool = UserAgentPool::new(agents(3)).unwrap();

        let mut previous = pool.get_agent_for_domain("example.com");
        for _ in 0..200 {
            let next = pool.get_agent_for_domain("example.com");
            assert_ne!(next, previous);
            previous = next;
        }
    }

    #[test]
    fn test_domains_rotate_independently() {
        let mut pool = UserAgentPool::new(agents(2)).unwrap();

        let a1 = pool.get_agent_for_domain("a.com");
        let b1 = pool.get_agent_for_domain("b.com");
        let a2 = pool.get_agent_for_domain("a.com");
        let b2 = pool.get_agent_for_domain("b.com");

        // With two agents every domain must alternate
        assert_ne!(a1, a2);
        assert_ne!(b1, b2);
    }

    #[test]
    fn test_single_agent_pool() {
        let mut pool = UserAgentPool::new(agents(1)).unwrap();
        assert_eq!(pool.get_agent_for_domain("x.com"), "agent-0");
        assert_eq!(pool.get_agent_for_domain("x.com"), "agent-0");
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(UserAgentPool::new(Vec::new()).is_err());
    }
}
