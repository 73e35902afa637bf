// DocQA Infrastructure - System Adapters
// Implements: ResourceSampler

pub mod resource_sampler_impl;

pub use resource_sampler_impl::SysinfoResourceSampler;
