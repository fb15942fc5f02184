mod slot_list;

pub(crate) use self::slot_list::{SlotLinks, SlotList};
