
use stun::attributes::ATTR_USE_CANDIDATE;
use stun::message::*;

/// The zero-length USE-CANDIDATE attribute: the controlling agent's signal
/// that the check it rides on nominates the pair. Only nomination re-checks
/// carry it; ordinary paced checks never do.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct UseCandidateAttr;

impl Setter for UseCandidateAttr {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_USE_CANDIDATE, &[]);
        Ok(())
    }
}

impl Getter for UseCandidateAttr {
    /// There is no value to decode; getting succeeds iff the flag is present,
    /// mirroring how the other zero-state ICE attributes in this crate parse.
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        m.get(ATTR_USE_CANDIDATE)?;
        Ok(())
    }
}
